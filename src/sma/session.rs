use crate::error::{Error, Result};
use crate::registry::{self, SharedRegistry};
use crate::sma::address::{DeviceAddress, SmaSerial, ADDRESS_LEN};
use crate::sma::data_point::QueryGroup;
use crate::sma::decoder::TelemetryDecoder;
use crate::sma::frame::{self, Expected, Frame, FrameWriter, PacketStats};
use crate::sma::packet::{Command, Request, PASSWORD_LEN, USER_GROUP_INSTALLER, USER_GROUP_USER};
use crate::sma::transport::Transport;
use crate::utils::Utils;

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Reads allowed for the plant to announce its topology during build-up.
pub const BUILDUP_READ_CYCLES: usize = 6;

const NET_ID_OFFSET: usize = 4;
const ROOT_FLAG_OFFSET: usize = 6;
const LOCAL_ADDRESS_OFFSET: usize = 7;
const DEVICE_ENTRY_LEN: usize = 8;
const IDENTITY_OFFSET: usize = 26;
const LOGON_TIMESTAMP_OFFSET: usize = 12;

const INVERTER_TYPE: (u8, u8) = (0x01, 0x01);
const WRONG_PASSWORD: u16 = 0x0100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Closed,
    Opening,
    Discovering,
    NetworkBuildup,
    Ready,
    LoggedOn,
    Querying,
    LoggedOff,
}

// UserGroup {{{
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserGroup {
    #[default]
    User,
    Installer,
}

impl UserGroup {
    pub fn code(self) -> u32 {
        match self {
            UserGroup::User => USER_GROUP_USER,
            UserGroup::Installer => USER_GROUP_INSTALLER,
        }
    }

    fn password_offset(self) -> u8 {
        match self {
            UserGroup::User => 0x88,
            UserGroup::Installer => 0xBB,
        }
    }

    /// Shifts each password byte by the group offset, padding with the offset.
    pub fn encode_password(self, password: &str) -> [u8; PASSWORD_LEN] {
        let offset = self.password_offset();
        let mut encoded = [offset; PASSWORD_LEN];
        for (slot, byte) in encoded.iter_mut().zip(password.bytes()) {
            *slot = byte.wrapping_add(offset);
        }
        encoded
    }
} // }}}

// PlantTopology {{{
/// A device listed in a topology announcement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceEntry {
    pub address: DeviceAddress,
    pub device_type: u8,
    pub subtype: u8,
}

impl DeviceEntry {
    pub fn is_inverter(&self) -> bool {
        (self.device_type, self.subtype) == INVERTER_TYPE
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlantTopology {
    pub net_id: u8,
    pub local: DeviceAddress,
    pub root: Option<DeviceAddress>,
    pub inverters: Vec<DeviceAddress>,
    pub others: Vec<DeviceEntry>,
}

impl PlantTopology {
    /// Splits a topology payload into 8 byte entries: address, type, subtype.
    pub fn parse_devices(payload: &[u8]) -> Result<Vec<DeviceEntry>> {
        payload
            .chunks_exact(DEVICE_ENTRY_LEN)
            .map(|entry| {
                Ok(DeviceEntry {
                    address: DeviceAddress::from_slice(&entry[..ADDRESS_LEN])?,
                    device_type: entry[6],
                    subtype: entry[7],
                })
            })
            .collect()
    }

    fn set_devices(&mut self, devices: Vec<DeviceEntry>) {
        let (inverters, others): (Vec<_>, Vec<_>) =
            devices.into_iter().partition(DeviceEntry::is_inverter);
        self.inverters = inverters.into_iter().map(|d| d.address).collect();
        self.others = others;
    }
} // }}}

/// Connection parameters for one plant.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub address: DeviceAddress,
    pub user_group: UserGroup,
    pub password: String,
    pub logon_rounds: usize,
}

// SessionController {{{
/// Drives one plant through discovery, logon, queries and logoff over a
/// [`Transport`] it exclusively owns.
pub struct SessionController<T: Transport> {
    transport: T,
    config: SessionConfig,
    writer: FrameWriter,
    destination: DeviceAddress,
    packet_id: u16,
    state: SessionState,
    topology: Option<PlantTopology>,
    registry: SharedRegistry,
    stats: PacketStats,
}

impl<T: Transport> SessionController<T> {
    pub fn new(transport: T, config: SessionConfig, registry: SharedRegistry) -> Self {
        Self {
            transport,
            destination: config.address,
            config,
            writer: FrameWriter::new(DeviceAddress::default()),
            packet_id: 0,
            state: SessionState::Closed,
            topology: None,
            registry,
            stats: PacketStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn topology(&self) -> Option<&PlantTopology> {
        self.topology.as_ref()
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &PacketStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// One full session against the plant. The transport is closed on every
    /// exit path; after a failure while logged on a logoff is attempted first.
    pub async fn run(&mut self, groups: &[QueryGroup]) -> Result<()> {
        self.open().await?;

        let result = self.exchange(groups).await;
        if let Err(e) = &result {
            warn!("session with {} failed: {}", self.config.address, e);
            if matches!(self.state, SessionState::LoggedOn | SessionState::Querying) {
                if let Err(e) = self.logoff().await {
                    debug!("logoff after failure: {}", e);
                }
            }
        }

        self.close().await;
        result
    }

    async fn exchange(&mut self, groups: &[QueryGroup]) -> Result<()> {
        self.discover().await?;
        self.logon().await?;
        for group in groups {
            self.query(*group).await?;
        }
        self.logoff().await
    }

    pub async fn open(&mut self) -> Result<()> {
        self.require("open", &[SessionState::Closed])?;
        self.transport.open().await?;

        self.writer = FrameWriter::new(DeviceAddress::default());
        self.destination = self.config.address;
        self.transition(SessionState::Opening);
        Ok(())
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
        self.transition(SessionState::Closed);
    }

    /// Learns the net ID, local and root addresses and the inverter list, runs
    /// network build-up when needed, and identifies every inverter.
    pub async fn discover(&mut self) -> Result<&PlantTopology> {
        self.require("discover", &[SessionState::Opening])?;
        self.transition(SessionState::Discovering);

        self.writer
            .begin_frame(Command::NetIdQuery.into(), &DeviceAddress::NET_ID_QUERY);
        self.writer.write_bytes(b"ver\r\n");
        self.writer.write_length();
        self.send().await?;

        let frame = self.receive(Command::NetId, self.destination).await?;
        let net_id = frame.require(NET_ID_OFFSET + 1)?[NET_ID_OFFSET];

        self.writer
            .begin_frame(Command::NetId.into(), &self.destination);
        self.writer.write_u32(0x0070_0400);
        self.writer.write_u8(net_id);
        self.writer.write_u32(0);
        self.writer.write_u32(1);
        self.writer.write_length();
        self.send().await?;

        let frame = self.receive(Command::LocalAddress, self.destination).await?;
        let payload = frame.require(LOCAL_ADDRESS_OFFSET + ADDRESS_LEN)?;
        let root = if payload[ROOT_FLAG_OFFSET] == 2 {
            let root = DeviceAddress::from_slice(&payload[..ADDRESS_LEN])?;
            self.destination = root;
            Some(root)
        } else {
            None
        };
        let local = DeviceAddress::from_slice(&payload[LOCAL_ADDRESS_OFFSET..])?;
        self.writer.set_local_address(local);

        let frame = self.receive(Command::Topology, self.destination).await?;
        let mut topology = PlantTopology {
            net_id,
            local,
            root,
            inverters: Vec::new(),
            others: Vec::new(),
        };
        topology.set_devices(PlantTopology::parse_devices(&frame.payload)?);

        info!(
            "plant {}: net ID {}, local {}, {} inverter(s), {} other device(s)",
            self.config.address,
            net_id,
            local,
            topology.inverters.len(),
            topology.others.len()
        );

        if topology.inverters.len() == 1 && net_id > 1 {
            self.network_buildup(&mut topology).await?;
        }

        self.topology = Some(topology);
        self.identify().await?;

        self.topology
            .as_ref()
            .ok_or(Error::InvalidState {
                operation: "discover",
                state: self.state,
            })
    }

    // Asks a multi-inverter plant to re-announce its members.
    async fn network_buildup(&mut self, topology: &mut PlantTopology) -> Result<()> {
        self.transition(SessionState::NetworkBuildup);

        let handshake: [&[u32]; 3] = [&[0x000A, 0xAC], &[0x0002], &[0x0001, 0x0001]];
        for words in handshake {
            self.writer
                .begin_frame(Command::NetworkBuildup.into(), &self.destination);
            for word in words {
                self.writer.write_u32(*word);
            }
            self.writer.write_length();
            self.send().await?;
            self.receive(Command::BuildupAck, self.destination).await?;
        }

        let mut announcement = None;
        for cycle in 1..=BUILDUP_READ_CYCLES {
            match self.receive_any(self.destination).await {
                Ok(frame) => match Command::try_from(frame.command()) {
                    Ok(Command::Topology | Command::TopologyChanged | Command::NetworkReady) => {
                        announcement = Some(frame);
                        break;
                    }
                    _ => debug!("build-up cycle {}: ignoring 0x{:04X}", cycle, frame.command()),
                },
                Err(e) if e.is_timeout() => debug!("build-up cycle {} timed out", cycle),
                Err(e) => return Err(e),
            }
        }

        let mut frame = announcement.ok_or_else(|| {
            Error::NetworkBuildup(format!(
                "no topology announced within {} reads; a single-inverter plant should be addressed directly",
                BUILDUP_READ_CYCLES
            ))
        })?;

        if frame.command() == u16::from(Command::TopologyChanged) {
            frame = self.receive(Command::Topology, self.destination).await?;
        }
        if frame.command() == u16::from(Command::Topology) {
            topology.set_devices(PlantTopology::parse_devices(&frame.payload)?);
            info!("network build-up: {} inverter(s)", topology.inverters.len());
        }
        if frame.command() != u16::from(Command::NetworkReady) {
            self.receive(Command::NetworkReady, self.destination).await?;
        }

        Ok(())
    }

    async fn identify(&mut self) -> Result<()> {
        let inverters = self.inverters();
        {
            let mut registry = registry::write(&self.registry);
            for address in &inverters {
                registry.register(*address);
            }
        }

        self.send_request(&Request::Identify).await?;

        for _ in 0..inverters.len() {
            let frame = self.receive(Command::Packet, DeviceAddress::BROADCAST).await?;
            let serial = SmaSerial::new(
                frame.u16_at(IDENTITY_OFFSET)?,
                frame.u32_at(IDENTITY_OFFSET + 2)?,
            );

            if registry::write(&self.registry).assign_serial(&frame.source(), serial) {
                info!("inverter {} identified as {}", frame.source(), serial);
            } else {
                debug!("identification from unlisted device {}", frame.source());
            }
        }

        self.transition(SessionState::Ready);
        Ok(())
    }

    /// Logs on with the current time as the correlation timestamp.
    pub async fn logon(&mut self) -> Result<()> {
        self.logon_at(Utc::now().timestamp() as u32).await
    }

    /// Logs on, accepting replies that echo `timestamp` and our packet id.
    /// Each round reads one reply per known inverter; the first round with an
    /// acknowledgement succeeds.
    pub async fn logon_at(&mut self, timestamp: u32) -> Result<()> {
        self.require("logon", &[SessionState::Ready])?;

        let request = Request::Logon {
            user_group: self.config.user_group.code(),
            timestamp,
            password: self.config.user_group.encode_password(&self.config.password),
        };
        let packet_id = self.send_request(&request).await?;
        let inverters = self.inverters().len();

        for round in 1..=self.config.logon_rounds {
            let mut acknowledged = false;
            for _ in 0..inverters {
                let frame = self.receive(Command::Packet, DeviceAddress::BROADCAST).await?;
                if self.accept_logon_reply(&frame, packet_id, timestamp) {
                    acknowledged = true;
                }
            }

            if acknowledged {
                info!("logged on to {} as {:?}", self.config.address, self.config.user_group);
                self.transition(SessionState::LoggedOn);
                return Ok(());
            }
            debug!("logon round {} without acknowledgement", round);
        }

        Err(Error::LogonFailed {
            rounds: self.config.logon_rounds,
        })
    }

    fn accept_logon_reply(&self, frame: &Frame, packet_id: u16, timestamp: u32) -> bool {
        let Some(packet) = &frame.packet else {
            return false;
        };

        if packet.packet_id() != packet_id {
            debug!(
                "logon reply for packet {}, expected {}",
                packet.packet_id(),
                packet_id
            );
            return false;
        }

        let echoed = Utils::u32ify(&frame.payload, LOGON_TIMESTAMP_OFFSET);
        if echoed != Some(timestamp) {
            debug!("logon reply echoes {:?}, sent {}", echoed, timestamp);
            return false;
        }

        if packet.error_code == WRONG_PASSWORD {
            warn!("inverter {} rejected the password", packet.source());
            return false;
        }

        let mut registry = registry::write(&self.registry);
        if !registry.assign_serial(&frame.source(), packet.source()) {
            debug!("logon reply from unlisted device {}", frame.source());
            return false;
        }

        true
    }

    /// Fetches one query group from every inverter. Returns the number of
    /// values decoded.
    pub async fn query(&mut self, group: QueryGroup) -> Result<usize> {
        self.require("query", &[SessionState::LoggedOn, SessionState::Querying])?;
        self.transition(SessionState::Querying);

        registry::write(&self.registry).invalidate(group);
        let packet_id = self.send_request(&Request::Query(group)).await?;

        let mut record_size = None;
        let mut decoded_values = 0;
        for _ in 0..self.inverters().len() {
            loop {
                let frame = self.receive(Command::Packet, DeviceAddress::BROADCAST).await?;
                let Some(packet) = &frame.packet else {
                    self.stats.frames_discarded += 1;
                    continue;
                };

                if packet.packet_id() != packet_id {
                    debug!(
                        "{:?} reply for packet {}, expected {}",
                        group,
                        packet.packet_id(),
                        packet_id
                    );
                    self.stats.frames_discarded += 1;
                    continue;
                }

                let serial = packet.source();
                if !registry::read(&self.registry).contains_serial(&serial) {
                    debug!("{:?} reply from unknown inverter {}", group, serial);
                    self.stats.frames_discarded += 1;
                    continue;
                }

                if packet.error_code != 0 {
                    debug!("{} answered {:?} with error 0x{:04X}", serial, group, packet.error_code);
                }

                let decoded = TelemetryDecoder::decode_reply(&frame.payload, record_size);
                record_size = decoded.record_size;
                decoded_values += decoded.readings.len();
                debug!(
                    "{}: {:?} gave {} value(s), {} unknown record(s)",
                    serial,
                    group,
                    decoded.readings.len(),
                    decoded.skipped
                );

                registry::write(&self.registry).apply(&serial, &decoded);
                break;
            }
        }

        Ok(decoded_values)
    }

    /// Broadcasts a logoff. No reply is expected.
    pub async fn logoff(&mut self) -> Result<()> {
        self.require(
            "logoff",
            &[SessionState::Ready, SessionState::LoggedOn, SessionState::Querying],
        )?;
        self.send_request(&Request::Logoff).await?;
        self.transition(SessionState::LoggedOff);
        Ok(())
    }

    fn inverters(&self) -> Vec<DeviceAddress> {
        self.topology
            .as_ref()
            .map(|t| t.inverters.clone())
            .unwrap_or_default()
    }

    fn next_packet_id(&mut self) -> u16 {
        self.packet_id = (self.packet_id + 1) & 0x7FFF;
        self.packet_id
    }

    // Rebuilds the request with a fresh packet id until its FCS can be sent
    // unescaped, then sends it.
    async fn send_request(&mut self, request: &Request) -> Result<u16> {
        loop {
            let packet_id = self.next_packet_id();
            request.encode(&mut self.writer, packet_id);
            if self.writer.is_checksum_plausible() {
                self.send().await?;
                return Ok(packet_id);
            }
            self.stats.packets_rebuilt += 1;
            debug!("packet {} has an implausible checksum, rebuilding", packet_id);
        }
    }

    async fn send(&mut self) -> Result<()> {
        debug!("TX {}", Utils::hex(self.writer.as_bytes()));
        self.transport.write_all(self.writer.as_bytes()).await?;
        self.stats.frames_sent += 1;
        Ok(())
    }

    async fn receive(&mut self, command: Command, source: DeviceAddress) -> Result<Frame> {
        let expected = Expected::Command(command.into());
        frame::read_frame(&mut self.transport, expected, &source, &mut self.stats).await
    }

    async fn receive_any(&mut self, source: DeviceAddress) -> Result<Frame> {
        frame::read_frame(&mut self.transport, Expected::Any, &source, &mut self.stats).await
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("session {}: {:?} -> {:?}", self.config.address, self.state, next);
            self.state = next;
        }
    }
} // }}}
