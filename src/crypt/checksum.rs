//! Checksum primitives for legacy-mode message integrity.
//!
//! DESFire's legacy CRC-16 is the ISO/IEC 14443-3 CRC_A: the ITU-T V.41
//! polynomial x¹⁶+x¹²+x⁵+1 seeded with `0x6363` instead of `0xFFFF` and
//! without the final bit inversion. A CRC over an empty buffer therefore
//! returns the seed itself. The CRC-32 is the standard ISO-HDLC one.
//!
//! Both checksums travel on the wire in little-endian byte order.


use crc::{Crc, CRC_16_ISO_IEC_14443_3_A, CRC_32_ISO_HDLC};


const CRC16_A: Crc<u16> = Crc::<u16>::new(&CRC_16_ISO_IEC_14443_3_A);
const CRC32_STD: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);


pub fn crc16(data: &[u8]) -> u16 {
    CRC16_A.checksum(data)
}

pub fn crc32(data: &[u8]) -> u32 {
    CRC32_STD.checksum(data)
}

/// On-wire form of [`crc16`].
pub fn crc16_bytes(data: &[u8]) -> [u8; 2] {
    crc16(data).to_le_bytes()
}

/// On-wire form of [`crc32`].
pub fn crc32_bytes(data: &[u8]) -> [u8; 4] {
    crc32(data).to_le_bytes()
}
