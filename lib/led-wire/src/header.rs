//! The 24-byte datagram header shared by every opcode, and the flags and
//! opcode enumerations carried within it.
//!
//! Checksum policy (spec §4.1): verify BEFORE byte-swapping on ingress
//! (the canonical checksum covers the network-order wire form), compute
//! AFTER byte-swapping on egress.

use crate::error::{WireError, WireResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const MAGIC: u32 = 0x4C49_4348; // "LICH"
pub const PROTOCOL_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 24;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_CHECKSUM: usize = 8;
const OFF_OPCODE: usize = 12;
const OFF_FLAGS: usize = 14;
const OFF_TXN: usize = 16;
const OFF_PAYLOAD_LEN: usize = 20;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[repr(u16)]
pub enum Opcode {
    NodeAnnouncement = 0,
    NodeStatus = 1,
    NodeAdoption = 2,
    FramebufferData = 3,
    SyncOutput = 4,
    Keepalive = 5,
}

impl Opcode {
    pub fn from_u16(value: u16) -> WireResult<Opcode> {
        Ok(match value {
            0 => Opcode::NodeAnnouncement,
            1 => Opcode::NodeStatus,
            2 => Opcode::NodeAdoption,
            3 => Opcode::FramebufferData,
            4 => Opcode::SyncOutput,
            5 => Opcode::Keepalive,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

/// Bitfield carried in the header's `flags` word.
#[derive(Debug, Eq, PartialEq, Copy, Clone, Default)]
pub struct Flags(pub u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const ACK: Flags = Flags(1 << 0);
    pub const NACK: Flags = Flags(1 << 1);
    pub const RESPONSE: Flags = Flags(1 << 2);
    pub const MULTICAST: Flags = Flags(1 << 3);

    #[inline]
    pub fn contains(self, bit: Flags) -> bool {
        self.0 & bit.0 == bit.0
    }

    #[inline]
    pub fn insert(&mut self, bit: Flags) {
        self.0 |= bit.0;
    }

    #[inline]
    pub fn remove(&mut self, bit: Flags) {
        self.0 &= !bit.0;
    }

    /// Clears ACK and sets NACK. The reference implementation botches this
    /// by `|=`-ing the bitwise complement of the NACK bit in one branch;
    /// spec §9 locks in the corrected behavior.
    #[inline]
    pub fn make_nack(&mut self) {
        self.remove(Flags::ACK);
        self.insert(Flags::NACK);
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    #[inline]
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Header {
    pub version: u32,
    pub opcode: Opcode,
    pub flags: Flags,
    pub txn: u32,
    pub payload_length: u32,
}

impl Header {
    /// Verifies magic, version and checksum directly on the wire bytes,
    /// before any byte-swapping takes place. Returns the validator's own
    /// result value — the reference's bug of reading an uninitialized `err`
    /// instead of this return value is the exact defect spec §9 forbids.
    pub fn validate(bytes: &[u8]) -> WireResult<()> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::TooShort);
        }

        let magic = (&bytes[OFF_MAGIC..]).read_u32::<BigEndian>().unwrap();
        if magic != MAGIC {
            return Err(WireError::BadMagic);
        }

        let version = (&bytes[OFF_VERSION..]).read_u32::<BigEndian>().unwrap();
        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion);
        }

        let wire_checksum = (&bytes[OFF_CHECKSUM..]).read_u32::<BigEndian>().unwrap();
        let computed = checksum_with_field_zeroed(bytes);
        if wire_checksum != computed {
            return Err(WireError::BadChecksum);
        }

        let payload_length = (&bytes[OFF_PAYLOAD_LEN..]).read_u32::<BigEndian>().unwrap() as usize;
        if bytes.len() < HEADER_LEN + payload_length {
            return Err(WireError::Truncated);
        }

        Ok(())
    }

    /// Decodes the header fields into host byte order. Callers must have
    /// already called [`Header::validate`].
    pub fn decode(bytes: &[u8]) -> WireResult<Header> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::TooShort);
        }

        let mut cursor = Cursor::new(bytes);
        let _magic = cursor.read_u32::<BigEndian>().unwrap();
        let version = cursor.read_u32::<BigEndian>().unwrap();
        let _checksum = cursor.read_u32::<BigEndian>().unwrap();
        let opcode = Opcode::from_u16(cursor.read_u16::<BigEndian>().unwrap())?;
        let flags = Flags(cursor.read_u16::<BigEndian>().unwrap());
        let txn = cursor.read_u32::<BigEndian>().unwrap();
        let payload_length = cursor.read_u32::<BigEndian>().unwrap();

        Ok(Header {
            version,
            opcode,
            flags,
            txn,
            payload_length,
        })
    }

    /// Writes magic, version, opcode into `buf` and zeroes flags/txn/checksum/
    /// length, leaving the payload area (if any) untouched. `buf` must be at
    /// least [`HEADER_LEN`] bytes.
    pub fn build(buf: &mut [u8], opcode: Opcode) {
        assert!(buf.len() >= HEADER_LEN, "buffer too small for header");

        let mut cursor = Cursor::new(&mut buf[..HEADER_LEN]);
        cursor.write_u32::<BigEndian>(MAGIC).unwrap();
        cursor.write_u32::<BigEndian>(PROTOCOL_VERSION).unwrap();
        cursor.write_u32::<BigEndian>(0).unwrap(); // checksum, filled in later
        cursor.write_u16::<BigEndian>(opcode as u16).unwrap();
        cursor.write_u16::<BigEndian>(0).unwrap(); // flags
        cursor.write_u32::<BigEndian>(0).unwrap(); // txn
        cursor.write_u32::<BigEndian>(0).unwrap(); // payload_length
    }

    /// Overwrites flags/txn/payload_length in an already-built header buffer.
    pub fn set_meta(buf: &mut [u8], flags: Flags, txn: u32, payload_length: u32) {
        assert!(buf.len() >= HEADER_LEN, "buffer too small for header");
        (&mut buf[OFF_FLAGS..]).write_u16::<BigEndian>(flags.0).unwrap();
        (&mut buf[OFF_TXN..]).write_u32::<BigEndian>(txn).unwrap();
        (&mut buf[OFF_PAYLOAD_LEN..]).write_u32::<BigEndian>(payload_length).unwrap();
    }

    /// Zeroes the checksum field, computes the CRC-32 (IEEE 802.3 polynomial)
    /// over the whole datagram and writes it back in network byte order.
    /// Must be called after byte-swapping so the checksum covers the
    /// network-order wire form exactly as the verifier expects.
    pub fn apply_checksum(bytes: &mut [u8]) {
        (&mut bytes[OFF_CHECKSUM..]).write_u32::<BigEndian>(0).unwrap();
        let crc = checksum_with_field_zeroed(bytes);
        (&mut bytes[OFF_CHECKSUM..]).write_u32::<BigEndian>(crc).unwrap();
    }
}

fn checksum_with_field_zeroed(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..OFF_CHECKSUM]);
    hasher.update(&[0u8; 4]);
    hasher.update(&bytes[OFF_CHECKSUM + 4..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_header_with_checksum() {
        let mut buf = vec![0u8; HEADER_LEN];
        Header::build(&mut buf, Opcode::NodeStatus);
        Header::set_meta(&mut buf, Flags::ACK | Flags::RESPONSE, 42, 0);
        Header::apply_checksum(&mut buf);

        assert!(Header::validate(&buf).is_ok());
        let hdr = Header::decode(&buf).unwrap();
        assert_eq!(hdr.opcode, Opcode::NodeStatus);
        assert_eq!(hdr.txn, 42);
        assert!(hdr.flags.contains(Flags::ACK));
        assert!(hdr.flags.contains(Flags::RESPONSE));
        assert!(!hdr.flags.contains(Flags::NACK));
    }

    #[test]
    fn bit_flip_in_checksum_is_rejected() {
        let mut buf = vec![0u8; HEADER_LEN];
        Header::build(&mut buf, Opcode::Keepalive);
        Header::apply_checksum(&mut buf);

        buf[OFF_CHECKSUM] ^= 0x01;

        assert_eq!(Header::validate(&buf), Err(WireError::BadChecksum));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = vec![0u8; HEADER_LEN];
        Header::build(&mut buf, Opcode::Keepalive);
        Header::apply_checksum(&mut buf);
        buf[0] ^= 0xFF;

        assert_eq!(Header::validate(&buf), Err(WireError::BadMagic));
    }

    #[test]
    fn too_short_is_rejected() {
        let buf = vec![0u8; HEADER_LEN - 1];
        assert_eq!(Header::validate(&buf), Err(WireError::TooShort));
    }

    #[test]
    fn make_nack_clears_ack_and_sets_nack() {
        let mut flags = Flags::ACK;
        flags.make_nack();
        assert!(!flags.contains(Flags::ACK));
        assert!(flags.contains(Flags::NACK));
    }
}
