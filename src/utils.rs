use nom::bytes::complete::take;
use nom::IResult;

use crate::sma::address::DeviceAddress;

pub struct Utils;

impl Utils {
    // nom parser for a 6 byte address in wire order
    pub fn address(input: &[u8]) -> IResult<&[u8], DeviceAddress> {
        let (input, bytes) = take(6usize)(input)?;
        let mut wire = [0u8; 6];
        wire.copy_from_slice(bytes);
        Ok((input, DeviceAddress::from_wire(wire)))
    }

    pub fn u16ify(data: &[u8], offset: usize) -> Option<u16> {
        let bytes = data.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32ify(data: &[u8], offset: usize) -> Option<u32> {
        let bytes = data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn u64ify(data: &[u8], offset: usize) -> Option<u64> {
        let bytes = data.get(offset..offset + 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }

    /// Space separated hex dump, used for debug logging of frames.
    pub fn hex(data: &[u8]) -> String {
        data.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
