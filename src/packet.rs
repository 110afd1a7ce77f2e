//! KD wire-format vocabulary: packet leaders, the 16-byte packet header,
//! and the payload checksum.
//!
//! Everything on the wire is little-endian, regardless of the host.

use byteorder::{ByteOrder, LittleEndian};

/// Leader of a data packet, the ASCII bytes "0000".
pub const PACKET_LEADER: u32 = 0x3030_3030;
/// Leader of a control packet, the ASCII bytes "iiii".
pub const CONTROL_PACKET_LEADER: u32 = 0x6969_6969;

pub const PACKET_LEADER_BYTE: u8 = 0x30;
pub const CONTROL_PACKET_LEADER_BYTE: u8 = 0x69;

/// Single byte following the payload of every data packet.
pub const PACKET_TRAILING_BYTE: u8 = 0xAA;

/// Out-of-band byte the debugger sends to interrupt the target.
pub const BREAKIN_PACKET_BYTE: u8 = 0x62;

/// Upper bound on the payload of a data packet.
pub const PACKET_MAX_SIZE: usize = 4000;

/// First packet id after the reset handshake completes.
pub const INITIAL_PACKET_ID: u32 = 0x8080_0000;
/// OR'd into a packet id to force the peer to resynchronize.
pub const SYNC_PACKET_ID: u32 = 0x0000_0800;
/// Packet id the control counter starts out with, before any reset.
pub const RESET_PACKET_ID: u32 = INITIAL_PACKET_ID | SYNC_PACKET_ID;

/// Number of defined packet types; anything at or above this is invalid.
pub const PACKET_TYPE_MAX: u16 = 12;

/// The KD packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    Unused = 0,
    StateChange32 = 1,
    StateManipulate = 2,
    DebugIo = 3,
    Acknowledge = 4,
    Resend = 5,
    Reset = 6,
    StateChange64 = 7,
    PollBreakin = 8,
    TraceIo = 9,
    ControlRequest = 10,
    FileIo = 11,
}

impl PacketType {
    pub fn from_u16(value: u16) -> Option<Self> {
        let ty = match value {
            0 => PacketType::Unused,
            1 => PacketType::StateChange32,
            2 => PacketType::StateManipulate,
            3 => PacketType::DebugIo,
            4 => PacketType::Acknowledge,
            5 => PacketType::Resend,
            6 => PacketType::Reset,
            7 => PacketType::StateChange64,
            8 => PacketType::PollBreakin,
            9 => PacketType::TraceIo,
            10 => PacketType::ControlRequest,
            11 => PacketType::FileIo,
            _ => return None,
        };
        Some(ty)
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::Unused => "KD_PACKET_TYPE_UNUSED",
            PacketType::StateChange32 => "KD_STATE_CHANGE32",
            PacketType::StateManipulate => "KD_STATE_MANIPULATE",
            PacketType::DebugIo => "KD_DEBUG_IO",
            PacketType::Acknowledge => "KD_ACKNOWLEDGE",
            PacketType::Resend => "KD_RESEND",
            PacketType::Reset => "KD_RESET",
            PacketType::StateChange64 => "KD_STATE_CHANGE64",
            PacketType::PollBreakin => "KD_POLL_BREAKIN",
            PacketType::TraceIo => "KD_TRACE_IO",
            PacketType::ControlRequest => "KD_CONTROL_REQUEST",
            PacketType::FileIo => "KD_FILE_IO",
        }
    }
}

/// Name for a raw packet type value, including invalid ones.
pub fn packet_type_name(value: u16) -> &'static str {
    match PacketType::from_u16(value) {
        Some(ty) => ty.name(),
        None => "<invalid packet type>",
    }
}

/// The fixed 16-byte packet header preceding every control and data packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KdPacket {
    pub packet_leader: u32,
    pub packet_type: u16,
    pub byte_count: u16,
    pub packet_id: u32,
    pub checksum: u32,
}

impl KdPacket {
    pub const HEADER_SIZE: usize = 16;

    pub fn is_control(&self) -> bool {
        self.packet_leader == CONTROL_PACKET_LEADER
    }

    pub fn ty(&self) -> Option<PacketType> {
        PacketType::from_u16(self.packet_type)
    }

    pub fn to_bytes(&self) -> [u8; Self::HEADER_SIZE] {
        let mut buf = [0u8; Self::HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.packet_leader);
        LittleEndian::write_u16(&mut buf[4..6], self.packet_type);
        LittleEndian::write_u16(&mut buf[6..8], self.byte_count);
        LittleEndian::write_u32(&mut buf[8..12], self.packet_id);
        LittleEndian::write_u32(&mut buf[12..16], self.checksum);
        buf
    }

    /// Parses a header from the first 16 bytes of `data`.
    pub fn from_bytes(data: &[u8; Self::HEADER_SIZE]) -> Self {
        KdPacket {
            packet_leader: LittleEndian::read_u32(&data[0..4]),
            packet_type: LittleEndian::read_u16(&data[4..6]),
            byte_count: LittleEndian::read_u16(&data[6..8]),
            packet_id: LittleEndian::read_u32(&data[8..12]),
            checksum: LittleEndian::read_u32(&data[12..16]),
        }
    }
}

/// Byte-sum checksum over the payload. The header is not included; control
/// packets carry checksum 0.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}
