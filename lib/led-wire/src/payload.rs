//! Per-opcode payload layouts (spec §3). Every payload is encoded/decoded in
//! network byte order through the same `byteorder` cursor idiom as the
//! header.

use crate::error::{WireError, WireResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::net::Ipv4Addr;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum PixelFormat {
    Rgb,
    Rgbw,
}

impl PixelFormat {
    #[inline]
    pub fn bytes_per_element(self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgbw => 4,
        }
    }

    fn from_u8(value: u8) -> WireResult<PixelFormat> {
        match value {
            3 => Ok(PixelFormat::Rgb),
            4 => Ok(PixelFormat::Rgbw),
            _ => Err(WireError::Truncated),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub software_version: u32,
    pub hardware_version: u32,
    pub listen_port: u16,
    pub advertised_ipv4: Ipv4Addr,
    pub mac: [u8; 6],
    pub framebuffer_capacity: u32,
    pub channel_count: u16,
    pub hostname: String,
}

impl Announcement {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.software_version).unwrap();
        buf.write_u32::<BigEndian>(self.hardware_version).unwrap();
        buf.write_u16::<BigEndian>(self.listen_port).unwrap();
        buf.extend_from_slice(&self.advertised_ipv4.octets());
        buf.extend_from_slice(&self.mac);
        buf.write_u32::<BigEndian>(self.framebuffer_capacity).unwrap();
        buf.write_u16::<BigEndian>(self.channel_count).unwrap();

        let name_bytes = self.hostname.as_bytes();
        buf.write_u16::<BigEndian>(name_bytes.len() as u16).unwrap();
        buf.extend_from_slice(name_bytes);
    }

    pub fn decode(bytes: &[u8]) -> WireResult<Announcement> {
        let mut cursor = Cursor::new(bytes);
        let software_version = read_u32(&mut cursor)?;
        let hardware_version = read_u32(&mut cursor)?;
        let listen_port = read_u16(&mut cursor)?;

        let mut ip_octets = [0u8; 4];
        read_exact(&mut cursor, &mut ip_octets)?;
        let advertised_ipv4 = Ipv4Addr::from(ip_octets);

        let mut mac = [0u8; 6];
        read_exact(&mut cursor, &mut mac)?;

        let framebuffer_capacity = read_u32(&mut cursor)?;
        let channel_count = read_u16(&mut cursor)?;

        let name_len = read_u16(&mut cursor)? as usize;
        let mut name_bytes = vec![0u8; name_len];
        read_exact(&mut cursor, &mut name_bytes)?;
        let hostname = String::from_utf8_lossy(&name_bytes).into_owned();

        Ok(Announcement {
            software_version,
            hardware_version,
            listen_port,
            advertised_ipv4,
            mac,
            framebuffer_capacity,
            channel_count,
            hostname,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Status {
    pub uptime_secs: u64,
    pub total_memory: u32,
    pub free_memory: u32,
    pub bad_crc_count: u32,
    pub cpu_load_percent: u8,
}

impl Status {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.uptime_secs).unwrap();
        buf.write_u32::<BigEndian>(self.total_memory).unwrap();
        buf.write_u32::<BigEndian>(self.free_memory).unwrap();
        buf.write_u32::<BigEndian>(self.bad_crc_count).unwrap();
        buf.write_u8(self.cpu_load_percent).unwrap();
    }

    pub fn decode(bytes: &[u8]) -> WireResult<Status> {
        let mut cursor = Cursor::new(bytes);
        Ok(Status {
            uptime_secs: read_u64(&mut cursor)?,
            total_memory: read_u32(&mut cursor)?,
            free_memory: read_u32(&mut cursor)?,
            bad_crc_count: read_u32(&mut cursor)?,
            cpu_load_percent: cursor.read_u8().map_err(|_| WireError::Truncated)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FramebufferData {
    pub channel: u16,
    pub format: PixelFormat,
    pub element_count: u32,
    pub pixels: Vec<u8>,
}

impl FramebufferData {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u16::<BigEndian>(self.channel).unwrap();
        buf.write_u8(self.format.bytes_per_element() as u8).unwrap();
        buf.write_u32::<BigEndian>(self.element_count).unwrap();
        buf.extend_from_slice(&self.pixels);
    }

    pub fn decode(bytes: &[u8]) -> WireResult<FramebufferData> {
        let mut cursor = Cursor::new(bytes);
        let channel = read_u16(&mut cursor)?;
        let format = PixelFormat::from_u8(cursor.read_u8().map_err(|_| WireError::Truncated)?)?;
        let element_count = read_u32(&mut cursor)?;

        let expected_len = element_count as usize * format.bytes_per_element();
        let pos = cursor.position() as usize;
        if bytes.len() - pos < expected_len {
            return Err(WireError::Truncated);
        }

        let pixels = bytes[pos..pos + expected_len].to_vec();

        Ok(FramebufferData {
            channel,
            format,
            element_count,
            pixels,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutput {
    pub channel_mask: u32,
}

impl SyncOutput {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.channel_mask).unwrap();
    }

    pub fn decode(bytes: &[u8]) -> WireResult<SyncOutput> {
        let mut cursor = Cursor::new(bytes);
        Ok(SyncOutput {
            channel_mask: read_u32(&mut cursor)?,
        })
    }
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> WireResult<u16> {
    cursor.read_u16::<BigEndian>().map_err(|_| WireError::Truncated)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> WireResult<u32> {
    cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> WireResult<u64> {
    cursor.read_u64::<BigEndian>().map_err(|_| WireError::Truncated)
}

fn read_exact(cursor: &mut Cursor<&[u8]>, out: &mut [u8]) -> WireResult<()> {
    std::io::Read::read_exact(cursor, out).map_err(|_| WireError::Truncated)
}
