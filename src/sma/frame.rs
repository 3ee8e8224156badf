use crate::error::{Error, Result};
use crate::sma::address::DeviceAddress;
use crate::sma::packet::{
    Command, FrameHeader, PacketHeader, FRAME_START, HEADER_LEN, L2_MARKER, L2_SIGNATURE,
    PACKET_HEADER_LEN,
};
use crate::sma::transport::Transport;
use crate::utils::Utils;

use bytes::{BufMut, Bytes, BytesMut};
use crc16::{State, X_25};
use log::{debug, trace};
use nom_derive::Parse;
use serde::Serialize;

pub const MAX_FRAME_LEN: usize = 520;
pub const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;
const RESERVED: [u8; 5] = [0x7D, 0x7E, 0x11, 0x12, 0x13];

// signature, packet header, checksum
const MIN_PACKET_LEN: usize = 4 + PACKET_HEADER_LEN + 2;

//////////
// BYTE STUFFING
//////////

pub fn needs_escape(byte: u8) -> bool {
    RESERVED.contains(&byte)
}

pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &byte in data {
        if needs_escape(byte) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out
}

/// Reverses [`escape`]. A dangling escape byte at the end of input is dropped.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            if let Some(&next) = bytes.next() {
                out.push(next ^ ESCAPE_XOR);
            }
        } else {
            out.push(byte);
        }
    }
    out
}

//////////
// CHECKSUM
//////////

/// CRC-16/X.25 frame check sequence over unescaped packet bytes.
pub fn checksum(data: &[u8]) -> u16 {
    State::<X_25>::calculate(data)
}

/// Checks a level-2 body (signature onwards, trailer stripped) against its
/// trailing little-endian FCS.
pub fn verify_checksum(body: &[u8]) -> bool {
    if body.len() < 2 {
        return false;
    }
    let (data, fcs) = body.split_at(body.len() - 2);
    checksum(data) == u16::from_le_bytes([fcs[0], fcs[1]])
}

// FrameWriter {{{
/// Builds one outbound frame at a time.
///
/// Every byte written through the `write_*` methods is folded into the rolling
/// FCS before being escaped; the header and trailer are written raw.
pub struct FrameWriter {
    buffer: BytesMut,
    fcs: State<X_25>,
    local: DeviceAddress,
}

impl FrameWriter {
    pub fn new(local: DeviceAddress) -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_LEN),
            fcs: State::<X_25>::new(),
            local,
        }
    }

    pub fn local_address(&self) -> DeviceAddress {
        self.local
    }

    pub fn set_local_address(&mut self, local: DeviceAddress) {
        self.local = local;
    }

    pub fn begin_frame(&mut self, control: u16, destination: &DeviceAddress) {
        self.buffer.clear();
        self.fcs = State::<X_25>::new();

        // length and header checksum are patched in by write_length
        self.buffer.put_slice(&[FRAME_START, 0, 0, 0]);
        self.buffer.put_slice(self.local.as_bytes());
        self.buffer.put_slice(destination.as_bytes());
        self.buffer.put_u16_le(control);
    }

    pub fn begin_packet(&mut self, header: &PacketHeader) {
        self.buffer.put_u8(FRAME_START);
        self.write_u32(L2_SIGNATURE);
        self.write_u8(header.longwords);
        self.write_u8(header.control);
        self.write_u16(header.destination_susy_id);
        self.write_u32(header.destination_serial);
        self.write_u16(header.control2);
        self.write_u16(header.source_susy_id);
        self.write_u32(header.source_serial);
        self.write_u16(header.source_control2);
        self.write_u16(header.error_code);
        self.write_u16(header.fragment_id);
        self.write_u16(header.packet_id);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.fcs.update(&[value]);
        if needs_escape(value) {
            self.buffer.put_u8(ESCAPE);
            self.buffer.put_u8(value ^ ESCAPE_XOR);
        } else {
            self.buffer.put_u8(value);
        }
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        for &byte in data {
            self.write_u8(byte);
        }
    }

    /// Appends the FCS and closing delimiter, then fixes up the header length.
    pub fn finalize_frame(&mut self) {
        let fcs = self.fcs.get();
        self.buffer.put_u16_le(fcs);
        self.buffer.put_u8(FRAME_START);
        self.write_length();
    }

    pub fn write_length(&mut self) {
        let [lo, hi] = (self.buffer.len() as u16).to_le_bytes();
        self.buffer[1] = lo;
        self.buffer[2] = hi;
        self.buffer[3] = FRAME_START ^ lo ^ hi;
    }

    /// False when an FCS byte collides with the delimiter or escape byte. The
    /// FCS is sent unescaped, so such a frame has to be rebuilt with another
    /// packet id.
    pub fn is_checksum_plausible(&self) -> bool {
        let len = self.buffer.len();
        if len < HEADER_LEN + 3 {
            return true;
        }
        self.buffer[len - 3..len - 1]
            .iter()
            .all(|b| *b != FRAME_START && *b != ESCAPE)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
} // }}}

fn mismatch(reason: impl Into<String>) -> Error {
    Error::ProtocolMismatch(reason.into())
}

// Frame {{{
/// Which command a read is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expected {
    Command(u16),
    Any,
}

impl Expected {
    fn check(self, command: u16) -> Result<()> {
        match self {
            Expected::Command(expected) if expected != command => Err(mismatch(format!(
                "command 0x{:04X}, waiting for 0x{:04X}",
                command, expected
            ))),
            _ => Ok(()),
        }
    }
}

/// One inbound frame.
///
/// For level-2 packets `payload` is the unescaped data following the packet
/// header, with signature, FCS and trailer removed; `header` is the one of the
/// frame that completed the packet. Other frames carry their body verbatim.
#[derive(Clone, Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub packet: Option<PacketHeader>,
    pub payload: Bytes,
    checksum_ok: bool,
}

impl Frame {
    /// Decodes a frame that stands on its own.
    pub fn decode(header: FrameHeader, body: &[u8]) -> Result<Self> {
        if !body.starts_with(&L2_MARKER) {
            return Ok(Self::plain(header, body));
        }

        let mut packet = Reassembly::default();
        let terminated = packet.start(body)?;
        packet.finish(header, terminated)
    }

    fn plain(header: FrameHeader, body: &[u8]) -> Self {
        Self {
            header,
            packet: None,
            payload: Bytes::copy_from_slice(body),
            checksum_ok: true,
        }
    }

    pub fn command(&self) -> u16 {
        self.header.command
    }

    pub fn source(&self) -> DeviceAddress {
        self.header.source
    }

    pub fn checksum_ok(&self) -> bool {
        self.checksum_ok
    }

    /// The payload, failing with `MalformedFrame` when shorter than `needed`.
    pub fn require(&self, needed: usize) -> Result<&[u8]> {
        if self.payload.len() < needed {
            return Err(self.too_short(needed));
        }
        Ok(&self.payload)
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        Utils::u16ify(&self.payload, offset).ok_or_else(|| self.too_short(offset + 2))
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        Utils::u32ify(&self.payload, offset).ok_or_else(|| self.too_short(offset + 4))
    }

    fn too_short(&self, needed: usize) -> Error {
        Error::MalformedFrame {
            command: self.command(),
            needed,
            actual: self.payload.len(),
        }
    }
} // }}}

// Reassembly {{{
/// A level-2 packet collected across frames.
///
/// Long replies arrive as `Command::Fragment` frames followed by a final
/// `Command::Packet` frame. Bodies are unescaped as they arrive; an escape byte
/// at the end of one frame applies to the first byte of the next.
#[derive(Debug, Default)]
pub struct Reassembly {
    data: BytesMut,
    escaped: bool,
    frames: usize,
}

impl Reassembly {
    pub fn is_active(&self) -> bool {
        self.frames > 0
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.escaped = false;
        self.frames = 0;
    }

    /// Starts over with a body that opens with the level-2 marker. Returns
    /// true when the closing delimiter came with it.
    pub fn start(&mut self, body: &[u8]) -> Result<bool> {
        self.clear();
        self.push(body.get(1..).unwrap_or_default())
    }

    /// Appends the next body. Returns true when it ends the packet.
    pub fn push(&mut self, body: &[u8]) -> Result<bool> {
        self.frames += 1;

        let (content, terminated) = match body.split_last() {
            Some((&FRAME_START, rest)) => (rest, true),
            _ => (body, false),
        };
        for &byte in content {
            if self.escaped {
                self.data.put_u8(byte ^ ESCAPE_XOR);
                self.escaped = false;
            } else if byte == ESCAPE {
                self.escaped = true;
            } else {
                self.data.put_u8(byte);
            }
        }

        let length = HEADER_LEN + 1 + self.data.len() + usize::from(terminated);
        if length > MAX_FRAME_LEN {
            self.clear();
            return Err(Error::FrameOverflow { length });
        }
        Ok(terminated)
    }

    /// Parses the collected packet and resets. Only a packet that ended with
    /// the delimiter can pass the FCS check.
    pub fn finish(&mut self, header: FrameHeader, terminated: bool) -> Result<Frame> {
        let unescaped = self.data.split().freeze();
        self.clear();

        if unescaped.len() < MIN_PACKET_LEN {
            return Err(Error::MalformedFrame {
                command: header.command,
                needed: MIN_PACKET_LEN,
                actual: unescaped.len(),
            });
        }

        let checksum_ok = terminated && verify_checksum(&unescaped);
        let content = &unescaped[4..unescaped.len() - 2];
        let (data, packet) = PacketHeader::parse(content).map_err(|_| Error::MalformedFrame {
            command: header.command,
            needed: PACKET_HEADER_LEN,
            actual: content.len(),
        })?;

        Ok(Frame {
            header,
            payload: Bytes::copy_from_slice(data),
            packet: Some(packet),
            checksum_ok,
        })
    }
} // }}}

// PacketStats {{{
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PacketStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_discarded: u64,
    pub checksum_errors: u64,
    pub packets_rebuilt: u64,
}

impl PacketStats {
    pub fn print_summary(&self, plant: &str) {
        log::info!("Packet statistics for {}:", plant);
        log::info!("  Frames sent: {}", self.frames_sent);
        log::info!("  Frames received: {}", self.frames_received);
        log::info!("  Frames discarded: {}", self.frames_discarded);
        log::info!("    of which checksum errors: {}", self.checksum_errors);
        log::info!("  Packets rebuilt for implausible checksum: {}", self.packets_rebuilt);
    }

    fn discard(&mut self, command: u16, reason: Error) {
        self.frames_discarded += 1;
        debug!("discarding frame 0x{:04X}: {}", command, reason);
    }
} // }}}

//////////
// READING
//////////

/// Reads the next frame header and body off the wire. Bytes before a valid
/// header are skipped, so a frame cut short by a read timeout does not leave
/// the stream misaligned.
async fn read_wire<T>(transport: &mut T) -> Result<(FrameHeader, Vec<u8>)>
where
    T: Transport + ?Sized,
{
    let mut head = [0u8; HEADER_LEN];
    transport.read_exact(&mut head).await?;

    let mut skipped = 0;
    let header = loop {
        let header = FrameHeader::decode(&head)?;
        if header.is_valid() {
            break header;
        }
        head.copy_within(1.., 0);
        transport.read_exact(&mut head[HEADER_LEN - 1..]).await?;
        skipped += 1;
    };
    if skipped > 0 {
        debug!("skipped {} byte(s) before the next frame header", skipped);
    }

    let length = header.length as usize;
    if length > MAX_FRAME_LEN {
        return Err(Error::FrameOverflow { length });
    }

    let mut body = vec![0u8; length.saturating_sub(HEADER_LEN)];
    if !body.is_empty() {
        transport.read_exact(&mut body).await?;
    }
    debug!("RX {} {}", Utils::hex(&head), Utils::hex(&body));

    Ok((header, body))
}

/// Reads a single frame, header first, then the declared remainder.
pub async fn read_raw<T>(transport: &mut T) -> Result<Frame>
where
    T: Transport + ?Sized,
{
    let (header, body) = read_wire(transport).await?;
    Frame::decode(header, &body)
}

/// Reads frames until one from `source` carries the expected command,
/// joining level-2 fragments into one packet on the way.
///
/// Frames from other senders, with another command, or failing the FCS check
/// are logged and dropped. The sender and command are checked before a
/// packet is parsed.
pub async fn read_frame<T>(
    transport: &mut T,
    expected: Expected,
    source: &DeviceAddress,
    stats: &mut PacketStats,
) -> Result<Frame>
where
    T: Transport + ?Sized,
{
    let mut packet = Reassembly::default();

    loop {
        let (header, body) = read_wire(transport).await?;
        stats.frames_received += 1;

        if header.source != *source {
            stats.discard(
                header.command,
                mismatch(format!("sender {} is not {}", header.source, source)),
            );
            continue;
        }

        let continues_packet = matches!(
            Command::try_from(header.command),
            Ok(Command::Packet | Command::Fragment)
        );

        let terminated = if body.starts_with(&L2_MARKER) {
            if packet.is_active() {
                stats.discard(header.command, mismatch("unfinished packet superseded"));
            }
            packet.start(&body)?
        } else if packet.is_active() && continues_packet {
            packet.push(&body)?
        } else {
            if packet.is_active() {
                packet.clear();
                stats.discard(header.command, mismatch("unfinished packet interrupted"));
            }
            match expected.check(header.command) {
                Ok(()) => return Ok(Frame::plain(header, &body)),
                Err(reason) => {
                    stats.discard(header.command, reason);
                    continue;
                }
            }
        };

        if !terminated && header.command == u16::from(Command::Fragment) {
            trace!("level-2 fragment {} from {}", packet.frames(), header.source);
            continue;
        }

        if let Err(reason) = expected.check(header.command) {
            packet.clear();
            stats.discard(header.command, reason);
            continue;
        }

        let frame = packet.finish(header, terminated)?;
        if !frame.checksum_ok() {
            stats.checksum_errors += 1;
            stats.discard(frame.command(), mismatch("checksum mismatch"));
            continue;
        }
        return Ok(frame);
    }
}
