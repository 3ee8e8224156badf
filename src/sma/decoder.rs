use crate::sma::data_point::{DataPoint, DataType, DeviceClass};
use crate::utils::Utils;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::Serialize;

/// Records follow the echoed command, first and last codes.
pub const RECORDS_OFFSET: usize = 12;
/// Stride used to skip unknown records until a known one fixes the real stride.
pub const DEFAULT_RECORD_SIZE: usize = 12;

const TIMESTAMP_OFFSET: usize = 4;
const VALUE_OFFSET: usize = 8;
const VERSION_OFFSET: usize = 24;
const NAME_LEN: usize = 32;

const NAN_S16: u16 = 0x8000;
const NAN_U16: u16 = 0xFFFF;
const NAN_S32: u32 = 0x8000_0000;
const NAN_U32: u32 = 0xFFFF_FFFF;
const NAN_S64: u64 = 0x8000_0000_0000_0000;
const NAN_U64: u64 = 0xFFFF_FFFF_FFFF_FFFF;

const ATTRIBUTE_END: u32 = 0x00FF_FFFE;
const RELEASE_TYPES: &[u8] = b"NEABRS";

// Value {{{
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    Attribute(u32),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Attribute(a) => Some(*a as f64),
            Value::Text(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(t) => write!(f, "{}", t),
            Value::Attribute(a) => match DeviceClass::try_from(*a) {
                Ok(class) => write!(f, "{}", class),
                Err(_) => write!(f, "{}", a),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
} // }}}

/// Output of one decode pass over a reply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Decoded {
    pub readings: Vec<(DataPoint, Reading)>,
    /// Stride fixed by the first recognised record, or the hint passed in.
    pub record_size: Option<usize>,
    pub skipped: usize,
}

impl Decoded {
    pub fn get(&self, data_point: DataPoint) -> Option<&Reading> {
        self.readings
            .iter()
            .find(|(dp, _)| *dp == data_point)
            .map(|(_, r)| r)
    }
}

pub struct TelemetryDecoder;

impl TelemetryDecoder {
    /// Decodes the payload of a telemetry reply.
    pub fn decode_reply(payload: &[u8], record_size: Option<usize>) -> Decoded {
        Self::decode(payload.get(RECORDS_OFFSET..).unwrap_or_default(), record_size)
    }

    /// Walks `records` in strides. The stride is unknown until the first
    /// recognised record, whose data type determines it for the rest of the
    /// buffer; unknown records before that are skipped 12 bytes at a time.
    pub fn decode(records: &[u8], record_size: Option<usize>) -> Decoded {
        let mut decoded = Decoded {
            record_size,
            ..Default::default()
        };

        let mut offset = 0;
        while let Some(code) = Utils::u32ify(records, offset) {
            let Some(data_point) = DataPoint::lookup(code) else {
                trace!("skipping unknown record 0x{:08X} at {}", code, offset);
                decoded.skipped += 1;
                offset += decoded.record_size.unwrap_or(DEFAULT_RECORD_SIZE);
                continue;
            };

            let size = *decoded
                .record_size
                .get_or_insert(data_point.data_type().record_size());
            let record = &records[offset..records.len().min(offset + size)];

            let timestamp = Utils::u32ify(record, TIMESTAMP_OFFSET)
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0));
            match (timestamp, Self::decode_value(data_point, record)) {
                (Some(timestamp), Some(value)) => {
                    trace!("{} = {}{}", data_point, value, data_point.unit().symbol());
                    decoded.readings.push((data_point, Reading { value, timestamp }));
                }
                _ => debug!("no value in {} record at {}", data_point, offset),
            }

            offset += size;
        }

        decoded
    }

    /// Decodes one record (code first) according to the data point's type,
    /// mapping NaN sentinels to zero and applying the unit scale.
    pub fn decode_value(data_point: DataPoint, record: &[u8]) -> Option<Value> {
        let unit = data_point.unit();

        let raw = match data_point.data_type() {
            DataType::I16 => Utils::u16ify(record, VALUE_OFFSET)
                .map(|raw| not_nan16(raw).map_or(0.0, |v| v as i16 as f64)),
            DataType::U16 => {
                Utils::u16ify(record, VALUE_OFFSET).map(|raw| not_nan16(raw).map_or(0.0, f64::from))
            }
            DataType::I32 => Utils::u32ify(record, VALUE_OFFSET)
                .map(|raw| not_nan32(raw).map_or(0.0, |v| v as i32 as f64)),
            DataType::U32 => {
                Utils::u32ify(record, VALUE_OFFSET).map(|raw| not_nan32(raw).map_or(0.0, f64::from))
            }
            DataType::I64 => Utils::u64ify(record, VALUE_OFFSET)
                .map(|raw| not_nan64(raw).map_or(0.0, |v| v as i64 as f64)),
            DataType::U64 => Utils::u64ify(record, VALUE_OFFSET)
                .map(|raw| not_nan64(raw).map_or(0.0, |v| v as f64)),
            DataType::Text => return decode_text(record),
            DataType::Status => return decode_status(record),
            DataType::Version => return decode_version(record),
        };

        raw.map(|r| Value::Number(unit.scale(r)))
    }
}

fn not_nan16(raw: u16) -> Option<u16> {
    (raw != NAN_S16 && raw != NAN_U16).then_some(raw)
}

fn not_nan32(raw: u32) -> Option<u32> {
    (raw != NAN_S32 && raw != NAN_U32).then_some(raw)
}

fn not_nan64(raw: u64) -> Option<u64> {
    (raw != NAN_S64 && raw != NAN_U64).then_some(raw)
}

fn decode_text(record: &[u8]) -> Option<Value> {
    let end = record.len().min(VALUE_OFFSET + NAME_LEN);
    let bytes = record.get(VALUE_OFFSET..end)?;
    let bytes = bytes.split(|b| *b == 0).next().unwrap_or_default();
    Some(Value::Text(String::from_utf8_lossy(bytes).trim().to_string()))
}

// 4 byte slots: low 24 bits attribute, high byte set to 1 when selected
fn decode_status(record: &[u8]) -> Option<Value> {
    let mut selected = None;
    let mut offset = VALUE_OFFSET;
    while let Some(slot) = Utils::u32ify(record, offset) {
        let attribute = slot & 0x00FF_FFFF;
        if attribute == ATTRIBUTE_END {
            break;
        }
        if slot >> 24 == 1 {
            selected = Some(attribute);
        }
        offset += 4;
    }
    selected.map(Value::Attribute)
}

// release type, build, minor (BCD), major (BCD)
fn decode_version(record: &[u8]) -> Option<Value> {
    let bytes = record.get(VERSION_OFFSET..VERSION_OFFSET + 4)?;
    let (release, build, minor, major) = (bytes[0], bytes[1], bytes[2], bytes[3]);
    let release = match RELEASE_TYPES.get(release as usize) {
        Some(c) => (*c as char).to_string(),
        None => release.to_string(),
    };
    Some(Value::Text(format!(
        "{:02X}.{:02X}.{:02}.{}",
        major, minor, build, release
    )))
}
