use crate::error::{Error, Result};
use crate::sma::address::{DeviceAddress, SmaSerial};
use crate::sma::data_point::QueryGroup;
use crate::sma::frame::FrameWriter;
use crate::utils::Utils;

use nom_derive::{Nom, Parse};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const FRAME_START: u8 = 0x7E;
pub const HEADER_LEN: usize = 18;
pub const PACKET_HEADER_LEN: usize = 24;

pub const L2_SIGNATURE: u32 = 0x6560_03FF;
// FRAME_START followed by L2_SIGNATURE on the wire
pub const L2_MARKER: [u8; 5] = [0x7E, 0xFF, 0x03, 0x60, 0x65];

pub const APP_SUSY_ID: u16 = 125;
pub const APP_SERIAL: u32 = 0x31B9_0F23;

const RESPONSE_FLAG: u16 = 0x8000;

/// Frame header control codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum Command {
    Packet = 0x0001,
    NetId = 0x0002,
    NetworkBuildup = 0x0003,
    BuildupAck = 0x0004,
    Topology = 0x0005,
    NetworkReady = 0x0006,
    /// Leading part of a level-2 packet split over several frames.
    Fragment = 0x0008,
    LocalAddress = 0x000A,
    TopologyChanged = 0x1001,
    NetIdQuery = 0x0201,
}

// FrameHeader {{{
/// The 18 byte outer header that starts every frame.
#[derive(Clone, Debug, PartialEq, Nom)]
#[nom(LittleEndian)]
pub struct FrameHeader {
    pub start: u8,
    pub length: u16,
    pub checksum: u8,
    #[nom(Parse = "Utils::address")]
    pub source: DeviceAddress,
    #[nom(Parse = "Utils::address")]
    pub destination: DeviceAddress,
    pub command: u16,
}

impl FrameHeader {
    pub fn decode(input: &[u8]) -> Result<Self> {
        match FrameHeader::parse(input) {
            Ok((_, header)) => Ok(header),
            Err(_) => Err(Error::MalformedFrame {
                command: 0,
                needed: HEADER_LEN,
                actual: input.len(),
            }),
        }
    }

    pub fn is_valid(&self) -> bool {
        let [lo, hi] = self.length.to_le_bytes();
        self.start == FRAME_START && self.checksum == FRAME_START ^ lo ^ hi
    }
} // }}}

// PacketHeader {{{
/// Level-2 packet header, following the signature inside a `Command::Packet` frame.
#[derive(Clone, Debug, PartialEq, Eq, Nom)]
#[nom(LittleEndian)]
pub struct PacketHeader {
    pub longwords: u8,
    pub control: u8,
    pub destination_susy_id: u16,
    pub destination_serial: u32,
    pub control2: u16,
    pub source_susy_id: u16,
    pub source_serial: u32,
    pub source_control2: u16,
    pub error_code: u16,
    pub fragment_id: u16,
    pub packet_id: u16,
}

impl PacketHeader {
    /// Header for a request sent by us to every device on the network.
    pub fn broadcast(longwords: u8, control: u8, control2: u16, packet_id: u16) -> Self {
        Self {
            longwords,
            control,
            destination_susy_id: SmaSerial::ANY.susy_id,
            destination_serial: SmaSerial::ANY.serial,
            control2,
            source_susy_id: APP_SUSY_ID,
            source_serial: APP_SERIAL,
            source_control2: control2,
            error_code: 0,
            fragment_id: 0,
            packet_id: packet_id | RESPONSE_FLAG,
        }
    }

    pub fn source(&self) -> SmaSerial {
        SmaSerial::new(self.source_susy_id, self.source_serial)
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id & !RESPONSE_FLAG
    }
} // }}}

// Request {{{
pub const USER_GROUP_USER: u32 = 0x07;
pub const USER_GROUP_INSTALLER: u32 = 0x0A;
pub const PASSWORD_LEN: usize = 12;
const LOGON_TIMEOUT_SECS: u32 = 900;

/// Level-2 requests broadcast by the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Identify,
    Logon {
        user_group: u32,
        timestamp: u32,
        password: [u8; PASSWORD_LEN],
    },
    Logoff,
    Query(QueryGroup),
}

impl Request {
    pub fn header(&self, packet_id: u16) -> PacketHeader {
        match self {
            Request::Identify | Request::Query(_) => {
                PacketHeader::broadcast(0x09, 0xA0, 0x0000, packet_id)
            }
            Request::Logon { .. } => PacketHeader::broadcast(0x0E, 0xA0, 0x0100, packet_id),
            Request::Logoff => PacketHeader::broadcast(0x08, 0xA0, 0x0300, packet_id),
        }
    }

    /// Encodes the complete frame, header to trailer, into `writer`.
    pub fn encode(&self, writer: &mut FrameWriter, packet_id: u16) {
        writer.begin_frame(Command::Packet.into(), &DeviceAddress::BROADCAST);
        writer.begin_packet(&self.header(packet_id));

        match self {
            Request::Identify => {
                writer.write_u32(0x0000_0200);
                writer.write_u32(0);
                writer.write_u32(0);
            }
            Request::Logon {
                user_group,
                timestamp,
                password,
            } => {
                writer.write_u32(0xFFFD_040C);
                writer.write_u32(*user_group);
                writer.write_u32(LOGON_TIMEOUT_SECS);
                writer.write_u32(*timestamp);
                writer.write_u32(0);
                writer.write_bytes(password);
            }
            Request::Logoff => {
                writer.write_u32(0xFFFD_010E);
                writer.write_u32(0xFFFF_FFFF);
            }
            Request::Query(group) => {
                writer.write_u32(group.command());
                writer.write_u32(group.first());
                writer.write_u32(group.last());
            }
        }

        writer.finalize_frame();
    }
} // }}}
