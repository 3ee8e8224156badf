#![allow(dead_code)]

use async_trait::async_trait;
use sma_bridge::prelude::*;
use sma_bridge::sma::frame::{self, FrameWriter};
use sma_bridge::sma::packet::{
    Command, PacketHeader, APP_SERIAL, APP_SUSY_ID, FRAME_START, HEADER_LEN, PACKET_HEADER_LEN,
};
use sma_bridge::sma::session::{SessionConfig, UserGroup, BUILDUP_READ_CYCLES};
use sma_bridge::sma::transport::Transport;
use sma_bridge::utils::Utils;

use std::collections::VecDeque;
use std::io::{Error as IoError, ErrorKind};
use std::sync::{Arc, Mutex};

pub const TIMESTAMP: u32 = 1_700_000_000;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Sent {{{
/// A frame written by the code under test, split into its parts.
#[derive(Clone, Debug)]
pub struct Sent {
    pub bytes: Vec<u8>,
    pub command: u16,
    pub destination: DeviceAddress,
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl Sent {
    pub fn parse(bytes: &[u8]) -> Self {
        let command = u16::from_le_bytes([bytes[16], bytes[17]]);
        let destination = DeviceAddress::from_slice(&bytes[10..16]).unwrap();

        if bytes.len() > HEADER_LEN + 3 && bytes[HEADER_LEN] == FRAME_START {
            // signature and packet header precede the payload; FCS and trailer are raw
            let content = frame::unescape(&bytes[HEADER_LEN + 1..bytes.len() - 3]);
            Self {
                bytes: bytes.to_vec(),
                command,
                destination,
                packet_id: Utils::u16ify(&content, 26).map(|id| id & 0x7FFF),
                payload: content[4 + PACKET_HEADER_LEN..].to_vec(),
            }
        } else {
            Self {
                bytes: bytes.to_vec(),
                command,
                destination,
                packet_id: None,
                payload: bytes[HEADER_LEN..].to_vec(),
            }
        }
    }

    /// First payload word of a level-2 request.
    pub fn request(&self) -> Option<u32> {
        self.packet_id.and(Utils::u32ify(&self.payload, 0))
    }

    pub fn is_logoff(&self) -> bool {
        self.request() == Some(0xFFFD_010E)
    }
} // }}}

// MockTransport {{{
pub enum Reply {
    Frame(Vec<u8>),
    Timeout,
}

#[derive(Debug, Default)]
pub struct MockLog {
    pub sent: Vec<Sent>,
    pub opens: usize,
    pub closes: usize,
}

type Responder = Box<dyn FnMut(&Sent) -> Vec<Reply> + Send>;

/// Answers each written frame with whatever the responder queues. Reads past
/// the queued replies fail with `UnexpectedEof`.
pub struct MockTransport {
    responder: Responder,
    replies: VecDeque<Reply>,
    pending: VecDeque<u8>,
    failing_opens: usize,
    log: Arc<Mutex<MockLog>>,
}

impl MockTransport {
    pub fn new(responder: impl FnMut(&Sent) -> Vec<Reply> + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            replies: VecDeque::new(),
            pending: VecDeque::new(),
            failing_opens: 0,
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }

    /// A transport that only plays back `replies`.
    pub fn replaying(replies: Vec<Reply>) -> Self {
        let mut transport = Self::new(|_| Vec::new());
        transport.replies.extend(replies);
        transport
    }

    pub fn failing_opens(mut self, count: usize) -> Self {
        self.failing_opens = count;
        self
    }

    pub fn log(&self) -> Arc<Mutex<MockLog>> {
        self.log.clone()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.log.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> sma_bridge::error::Result<()> {
        self.log.lock().unwrap().opens += 1;
        if self.failing_opens > 0 {
            self.failing_opens -= 1;
            return Err(IoError::new(ErrorKind::ConnectionRefused, "link down").into());
        }
        self.replies.clear();
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
    }

    async fn write_all(&mut self, buf: &[u8]) -> sma_bridge::error::Result<()> {
        let sent = Sent::parse(buf);
        let replies = (self.responder)(&sent);
        self.replies.extend(replies);
        self.log.lock().unwrap().sent.push(sent);
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> sma_bridge::error::Result<()> {
        while self.pending.len() < buf.len() {
            match self.replies.pop_front() {
                Some(Reply::Frame(bytes)) => self.pending.extend(bytes),
                Some(Reply::Timeout) => {
                    return Err(IoError::new(ErrorKind::TimedOut, "no data").into())
                }
                None => return Err(IoError::new(ErrorKind::UnexpectedEof, "no more replies").into()),
            }
        }
        for byte in buf.iter_mut() {
            *byte = self.pending.pop_front().unwrap();
        }
        Ok(())
    }
} // }}}

// SimulatedPlant {{{
#[derive(Clone, Debug)]
pub struct SimulatedInverter {
    pub address: DeviceAddress,
    pub serial: SmaSerial,
    pub records: Vec<(QueryGroup, Vec<u8>)>,
}

/// Answers the discovery, logon and query exchanges like a small plant.
#[derive(Clone, Debug)]
pub struct SimulatedPlant {
    pub address: DeviceAddress,
    pub local: DeviceAddress,
    pub net_id: u8,
    pub root_flag: u8,
    pub inverters: Vec<SimulatedInverter>,
    pub others: Vec<(DeviceAddress, u8, u8)>,
    /// Only the first inverter is listed until network build-up completes.
    pub buildup: bool,
    pub buildup_announces: bool,
    pub stale_logon_replies: usize,
    pub logon_accepted: bool,
    pub wrong_password: bool,
    pub stray_query_replies: bool,
    pub answer_queries: bool,
    /// Query replies arrive as a fragment frame plus a closing packet frame.
    pub fragmented_replies: bool,
}

impl SimulatedPlant {
    pub fn responder(self) -> impl FnMut(&Sent) -> Vec<Reply> + Send + 'static {
        let mut buildup_frames = 0;
        move |sent: &Sent| self.respond(sent, &mut buildup_frames)
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport::new(self.clone().responder())
    }

    fn respond(&self, sent: &Sent, buildup_frames: &mut usize) -> Vec<Reply> {
        match Command::try_from(sent.command) {
            Ok(Command::NetIdQuery) => vec![Reply::Frame(Factory::net_id_reply(
                self.address,
                self.local,
                self.net_id,
            ))],
            Ok(Command::NetId) => {
                let announced = if self.buildup {
                    &self.inverters[..1]
                } else {
                    &self.inverters[..]
                };
                vec![
                    Reply::Frame(Factory::local_address_reply(
                        self.address,
                        self.root_flag,
                        self.local,
                    )),
                    Reply::Frame(self.topology(announced)),
                ]
            }
            Ok(Command::NetworkBuildup) => {
                *buildup_frames += 1;
                let mut replies = vec![Reply::Frame(Factory::raw_frame(
                    self.address,
                    self.local,
                    Command::BuildupAck.into(),
                    &[0, 0, 0, 0],
                ))];
                if *buildup_frames == 3 {
                    replies.extend(self.announcement());
                }
                replies
            }
            Ok(Command::Packet) => self.respond_packet(sent),
            _ => Vec::new(),
        }
    }

    fn announcement(&self) -> Vec<Reply> {
        if !self.buildup_announces {
            return (0..BUILDUP_READ_CYCLES).map(|_| Reply::Timeout).collect();
        }

        vec![
            Reply::Timeout,
            Reply::Frame(Factory::raw_frame(
                self.address,
                self.local,
                Command::Fragment.into(),
                &[0, 0],
            )),
            Reply::Frame(Factory::raw_frame(
                self.address,
                self.local,
                Command::TopologyChanged.into(),
                &[],
            )),
            Reply::Frame(self.topology(&self.inverters)),
            Reply::Frame(Factory::raw_frame(
                self.address,
                self.local,
                Command::NetworkReady.into(),
                &[],
            )),
        ]
    }

    fn topology(&self, inverters: &[SimulatedInverter]) -> Vec<u8> {
        let mut entries: Vec<(DeviceAddress, u8, u8)> =
            inverters.iter().map(|i| (i.address, 0x01, 0x01)).collect();
        entries.extend(self.others.iter().copied());
        Factory::topology_reply(self.address, self.local, &entries)
    }

    fn respond_packet(&self, sent: &Sent) -> Vec<Reply> {
        let Some(request) = sent.request() else {
            return Vec::new();
        };
        let packet_id = sent.packet_id.unwrap_or_default();

        match request {
            0x0000_0200 => self
                .inverters
                .iter()
                .map(|inv| {
                    Reply::Frame(Factory::l2_reply(
                        inv.address,
                        self.local,
                        inv.serial,
                        packet_id,
                        0,
                        &Factory::identify_payload(inv.serial),
                    ))
                })
                .collect(),
            0xFFFD_040C => {
                let timestamp = Utils::u32ify(&sent.payload, 12).unwrap_or_default();
                let mut replies = Vec::new();
                for _ in 0..self.stale_logon_replies {
                    for inv in &self.inverters {
                        replies.push(Reply::Frame(Factory::logon_reply(
                            inv,
                            self.local,
                            packet_id,
                            0,
                            timestamp.wrapping_sub(1),
                        )));
                    }
                }
                if self.logon_accepted {
                    let error_code = if self.wrong_password { 0x0100 } else { 0 };
                    for inv in &self.inverters {
                        replies.push(Reply::Frame(Factory::logon_reply(
                            inv, self.local, packet_id, error_code, timestamp,
                        )));
                    }
                }
                replies
            }
            0xFFFD_010E => Vec::new(),
            command => {
                if !self.answer_queries {
                    return Vec::new();
                }
                let first = Utils::u32ify(&sent.payload, 4).unwrap_or_default();
                let Some(group) = QueryGroup::ALL
                    .iter()
                    .copied()
                    .find(|g| g.command() == command && g.first() == first)
                else {
                    return Vec::new();
                };

                let mut replies = Vec::new();
                for inv in &self.inverters {
                    let records: Vec<u8> = inv
                        .records
                        .iter()
                        .filter(|(g, _)| *g == group)
                        .flat_map(|(_, bytes)| bytes.iter().copied())
                        .collect();
                    let payload = Factory::records_payload(group, &records);

                    if self.stray_query_replies {
                        replies.push(Reply::Frame(Factory::l2_reply(
                            inv.address,
                            self.local,
                            inv.serial,
                            (packet_id + 7) & 0x7FFF,
                            0,
                            &payload,
                        )));
                    }
                    let reply = Factory::l2_reply(
                        inv.address,
                        self.local,
                        inv.serial,
                        packet_id,
                        0,
                        &payload,
                    );
                    if self.fragmented_replies {
                        let (head, tail) = Factory::split_reply(&reply, 40);
                        replies.push(Reply::Frame(head));
                        replies.push(Reply::Frame(tail));
                    } else {
                        replies.push(Reply::Frame(reply));
                    }
                }
                replies
            }
        }
    }
} // }}}

// Factory {{{
pub struct Factory;

impl Factory {
    pub fn address(s: &str) -> DeviceAddress {
        DeviceAddress::from_str(s).unwrap()
    }

    pub fn plant_address() -> DeviceAddress {
        Self::address("00:80:25:1D:AC:53")
    }

    pub fn local_address() -> DeviceAddress {
        Self::address("00:1A:7B:DA:71:0C")
    }

    pub fn serial() -> SmaSerial {
        SmaSerial::new(0x0083, 2_130_012_345)
    }

    pub fn inverter() -> SimulatedInverter {
        SimulatedInverter {
            address: Self::plant_address(),
            serial: Self::serial(),
            records: vec![
                (
                    QueryGroup::EnergyProduction,
                    [
                        Self::record_u64(0x0126_0101, TIMESTAMP, 5_000_000),
                        Self::record_u64(0x0126_2201, TIMESTAMP, 12_345),
                    ]
                    .concat(),
                ),
                (
                    QueryGroup::SpotACTotalPower,
                    Self::record_u32(0x4026_3F01, TIMESTAMP, 1500),
                ),
            ],
        }
    }

    pub fn second_inverter() -> SimulatedInverter {
        SimulatedInverter {
            address: Self::address("00:80:25:1D:AC:60"),
            serial: SmaSerial::new(0x0083, 2_130_012_399),
            records: vec![(
                QueryGroup::SpotACTotalPower,
                Self::record_u32(0x4026_3F01, TIMESTAMP, 2300),
            )],
        }
    }

    /// A single inverter plant with a second, non-inverter device.
    pub fn plant() -> SimulatedPlant {
        SimulatedPlant {
            address: Self::plant_address(),
            local: Self::local_address(),
            net_id: 1,
            root_flag: 2,
            inverters: vec![Self::inverter()],
            others: vec![(Self::address("00:80:25:2E:00:01"), 0x02, 0x01)],
            buildup: false,
            buildup_announces: true,
            stale_logon_replies: 0,
            logon_accepted: true,
            wrong_password: false,
            stray_query_replies: false,
            answer_queries: true,
            fragmented_replies: false,
        }
    }

    pub fn two_inverter_plant() -> SimulatedPlant {
        SimulatedPlant {
            inverters: vec![Self::inverter(), Self::second_inverter()],
            others: Vec::new(),
            ..Self::plant()
        }
    }

    pub fn session_config(address: DeviceAddress) -> SessionConfig {
        SessionConfig {
            address,
            user_group: UserGroup::User,
            password: "0000".to_string(),
            logon_rounds: 10,
        }
    }

    /// A frame whose body is sent verbatim.
    pub fn raw_frame(
        source: DeviceAddress,
        destination: DeviceAddress,
        command: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let [lo, hi] = ((HEADER_LEN + payload.len()) as u16).to_le_bytes();
        let mut bytes = vec![FRAME_START, lo, hi, FRAME_START ^ lo ^ hi];
        bytes.extend_from_slice(source.as_bytes());
        bytes.extend_from_slice(destination.as_bytes());
        bytes.extend_from_slice(&command.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    pub fn net_id_reply(source: DeviceAddress, local: DeviceAddress, net_id: u8) -> Vec<u8> {
        let payload = [0x00, 0x04, 0x70, 0x00, net_id, 0, 0, 0, 0, 1, 0, 0, 0];
        Self::raw_frame(source, local, Command::NetId.into(), &payload)
    }

    pub fn local_address_reply(
        source: DeviceAddress,
        root_flag: u8,
        local: DeviceAddress,
    ) -> Vec<u8> {
        let mut payload = source.as_bytes().to_vec();
        payload.push(root_flag);
        payload.extend_from_slice(local.as_bytes());
        Self::raw_frame(source, local, Command::LocalAddress.into(), &payload)
    }

    pub fn topology_reply(
        source: DeviceAddress,
        local: DeviceAddress,
        entries: &[(DeviceAddress, u8, u8)],
    ) -> Vec<u8> {
        let mut payload = Vec::new();
        for (address, device_type, subtype) in entries {
            payload.extend_from_slice(address.as_bytes());
            payload.push(*device_type);
            payload.push(*subtype);
        }
        Self::raw_frame(source, local, Command::Topology.into(), &payload)
    }

    /// A level-2 reply. The fragment id is bumped until the FCS contains no
    /// delimiter or escape byte.
    pub fn l2_reply(
        source: DeviceAddress,
        destination: DeviceAddress,
        serial: SmaSerial,
        packet_id: u16,
        error_code: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut writer = FrameWriter::new(source);
        let mut fragment_id = 0;
        loop {
            let header = PacketHeader {
                longwords: ((PACKET_HEADER_LEN + payload.len()) / 4) as u8,
                control: 0xE0,
                destination_susy_id: APP_SUSY_ID,
                destination_serial: APP_SERIAL,
                control2: 0,
                source_susy_id: serial.susy_id,
                source_serial: serial.serial,
                source_control2: 0,
                error_code,
                fragment_id,
                packet_id: packet_id | 0x8000,
            };
            writer.begin_frame(Command::Packet.into(), &destination);
            writer.begin_packet(&header);
            writer.write_bytes(payload);
            writer.finalize_frame();
            if writer.is_checksum_plausible() {
                return writer.as_bytes().to_vec();
            }
            fragment_id += 1;
        }
    }

    /// Splits a level-2 reply into a `Fragment` frame carrying the first `at`
    /// body bytes and a `Packet` frame carrying the rest.
    pub fn split_reply(reply: &[u8], at: usize) -> (Vec<u8>, Vec<u8>) {
        let source = DeviceAddress::from_slice(&reply[4..10]).unwrap();
        let destination = DeviceAddress::from_slice(&reply[10..16]).unwrap();
        let (head, tail) = reply[HEADER_LEN..].split_at(at);
        (
            Self::raw_frame(source, destination, Command::Fragment.into(), head),
            Self::raw_frame(source, destination, Command::Packet.into(), tail),
        )
    }

    pub fn identify_payload(serial: SmaSerial) -> Vec<u8> {
        let mut payload = vec![0u8; 48];
        payload[..4].copy_from_slice(&0x0000_0201u32.to_le_bytes());
        payload[26..28].copy_from_slice(&serial.susy_id.to_le_bytes());
        payload[28..32].copy_from_slice(&serial.serial.to_le_bytes());
        payload
    }

    pub fn logon_payload(timestamp: u32) -> Vec<u8> {
        [0xFFFD_040D, 0x07, 900, timestamp, 0]
            .iter()
            .flat_map(|w: &u32| w.to_le_bytes())
            .collect()
    }

    pub fn logon_reply(
        inverter: &SimulatedInverter,
        local: DeviceAddress,
        packet_id: u16,
        error_code: u16,
        timestamp: u32,
    ) -> Vec<u8> {
        Self::l2_reply(
            inverter.address,
            local,
            inverter.serial,
            packet_id,
            error_code,
            &Self::logon_payload(timestamp),
        )
    }

    /// Echoed command, first and last codes followed by the records.
    pub fn records_payload(group: QueryGroup, records: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(group.command() + 1).to_le_bytes());
        payload.extend_from_slice(&group.first().to_le_bytes());
        payload.extend_from_slice(&group.last().to_le_bytes());
        payload.extend_from_slice(records);
        payload
    }

    fn record_head(code: u32, timestamp: u32) -> Vec<u8> {
        let mut record = code.to_le_bytes().to_vec();
        record.extend_from_slice(&timestamp.to_le_bytes());
        record
    }

    /// 28 byte record: value followed by min, max and spare slots.
    pub fn record_u32(code: u32, timestamp: u32, value: u32) -> Vec<u8> {
        let mut record = Self::record_head(code, timestamp);
        for _ in 0..4 {
            record.extend_from_slice(&value.to_le_bytes());
        }
        record.extend_from_slice(&1u32.to_le_bytes());
        record
    }

    pub fn record_u64(code: u32, timestamp: u32, value: u64) -> Vec<u8> {
        let mut record = Self::record_head(code, timestamp);
        record.extend_from_slice(&value.to_le_bytes());
        record
    }

    pub fn record_text(code: u32, timestamp: u32, text: &str) -> Vec<u8> {
        let mut record = Self::record_head(code, timestamp);
        let mut name = [0u8; 32];
        name[..text.len()].copy_from_slice(text.as_bytes());
        record.extend_from_slice(&name);
        record
    }

    /// 40 byte record with attribute slots; selected slots carry 1 in the top byte.
    pub fn record_status(code: u32, timestamp: u32, attributes: &[(u32, bool)]) -> Vec<u8> {
        let mut record = Self::record_head(code, timestamp);
        for (attribute, selected) in attributes {
            let tag = if *selected { 0x0100_0000 } else { 0 };
            record.extend_from_slice(&(attribute | tag).to_le_bytes());
        }
        while record.len() < 40 {
            record.extend_from_slice(&0x00FF_FFFEu32.to_le_bytes());
        }
        record
    }

    /// 40 byte record with release type, build, minor and major at offset 24.
    pub fn record_version(code: u32, timestamp: u32, version: [u8; 4]) -> Vec<u8> {
        let mut record = Self::record_head(code, timestamp);
        record.resize(24, 0);
        record.extend_from_slice(&version);
        record.resize(40, 0);
        record
    }
} // }}}
