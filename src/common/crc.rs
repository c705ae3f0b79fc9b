// src/common/crc.rs

use crc::{Algorithm, Crc};

use super::error::Sdi12Error;

/// SDI-12 response CRC, CRC-16/ARC: 0x8005 is the normal form of the
/// reflected polynomial 0xA001 given in the SDI-12 spec.
pub const SDI12_CRC: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x8005,
    init: 0x0000,
    refin: true,
    refout: true,
    xorout: 0x0000,
    check: 0xBB3D,
    residue: 0x0000,
};

const CRC16: Crc<u16> = Crc::<u16>::new(&SDI12_CRC);

/// CRC-16 over a response payload (address byte included, CRC trailer and
/// CR LF excluded).
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Encodes a CRC value into the three printable trailer characters:
/// top 4 bits, middle 6 bits, bottom 6 bits, each OR-ed with 0x40.
pub fn encode_crc_ascii(crc: u16) -> [u8; 3] {
    [
        0x40 | (crc >> 12) as u8,
        0x40 | ((crc >> 6) & 0x3f) as u8,
        0x40 | (crc & 0x3f) as u8,
    ]
}

/// Checks the three-character CRC trailer of `response` (line terminator
/// already stripped) against a CRC computed over the rest.
///
/// Returns `InvalidResponse` if the buffer cannot even hold a trailer, and
/// `CrcMismatch` if payload and trailer disagree.
pub fn verify_response_crc<E>(response: &[u8]) -> Result<(), Sdi12Error<E>>
where
    E: core::fmt::Debug,
{
    if response.len() <= 3 {
        return Err(Sdi12Error::InvalidResponse);
    }

    let (payload, trailer) = response.split_at(response.len() - 3);
    let calculated = crc16(payload);
    let expected = encode_crc_ascii(calculated);

    if trailer == expected {
        Ok(())
    } else {
        let mut received = 0u16;
        for b in trailer {
            received = received << 6 | u16::from(b & 0x3f);
        }
        Err(Sdi12Error::CrcMismatch {
            received,
            calculated,
        })
    }
}
