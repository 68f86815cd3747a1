//! OSTC3 firmware files.
//!
//! Firmware ships as an ASCII file of hex records, one per line:
//!
//! ```text
//! :aaaaaa dddddddd...dddd
//! ```
//!
//! with a 24-bit big-endian address and a fixed 16-byte payload (4 bytes
//! for the trailing checksum record). The payload is encrypted with
//! AES-128-ECB used as a keystream: the first record is the IV, each
//! following record is XORed with the encryption of the previous
//! ciphertext block. A 16-bit-sum fletcher variant over the plaintext
//! closes the file.
//!
//! This is a standalone subsystem; nothing here touches the download path.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use log::error;

use crate::bytes;
use crate::checksum;
use crate::error::{Error, Result};

/// Total firmware size (120 KiB).
pub const SZ_FIRMWARE: usize = 0x01_E000;

// This key is shared by the OSTC3 and its cousin, the OSTC Sport. The Frog
// uses the same scheme with another key.
const OSTC3_KEY: [u8; 16] = [
    0xF1, 0xE9, 0xB0, 0x30, 0x45, 0x6F, 0xBE, 0x55, 0xFF, 0xE7, 0xF8, 0x31, 0x13, 0x6C, 0xF2,
    0xFE,
];

/// A decrypted, checksum-verified firmware image.
pub struct FirmwareImage {
    data: Vec<u8>,
    checksum: u32,
}

impl FirmwareImage {
    /// Parse and decrypt a firmware file.
    pub fn from_bytes(contents: &[u8]) -> Result<Self> {
        let mut reader = RecordReader { contents, pos: 0 };

        let mut data = vec![0xFFu8; SZ_FIRMWARE];

        // The first record carries the IV for the keystream.
        let mut iv = [0u8; 16];
        reader.read_record(0, &mut iv).map_err(|e| {
            error!("Failed to parse header.");
            e
        })?;
        let mut nbytes = 16;

        let cipher = Aes128::new(GenericArray::from_slice(&OSTC3_KEY));
        let mut keystream = GenericArray::clone_from_slice(&iv);
        cipher.encrypt_block(&mut keystream);

        let mut encrypted = [0u8; 16];
        for addr in (0..SZ_FIRMWARE).step_by(16) {
            reader.read_record(nbytes, &mut encrypted).map_err(|e| {
                error!("Failed to parse file data.");
                e
            })?;

            for i in 0..16 {
                data[addr + i] = encrypted[i] ^ keystream[i];
            }

            // Next keystream block from the current ciphertext.
            keystream = GenericArray::clone_from_slice(&encrypted);
            cipher.encrypt_block(&mut keystream);

            nbytes += 16;
        }

        // The tail record stores the expected checksum.
        let mut tail = [0u8; 4];
        reader.read_record(nbytes, &mut tail).map_err(|e| {
            error!("Failed to parse file tail.");
            e
        })?;
        let checksum = bytes::u32_le(&tail);

        if checksum != checksum::fletcher16_u32(&data) {
            error!("Failed to verify file checksum.");
            return Err(Error::DataFormat("firmware checksum mismatch".into()));
        }

        Ok(Self { data, checksum })
    }

    /// Load a firmware file from disk.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read(path)?;
        Self::from_bytes(&contents)
    }

    /// The decrypted firmware bytes (always [`SZ_FIRMWARE`] long).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The verified image checksum.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

struct RecordReader<'a> {
    contents: &'a [u8],
    pos: usize,
}

impl RecordReader<'_> {
    /// Read one record, checking its address against the running byte
    /// counter.
    fn read_record(&mut self, addr: usize, payload: &mut [u8]) -> Result<()> {
        if payload.len() > 16 {
            return Err(Error::InvalidArgs("records carry at most 16 bytes".into()));
        }

        // Find the start code; only line breaks may precede it.
        loop {
            let byte = *self
                .contents
                .get(self.pos)
                .ok_or_else(|| Error::DataFormat("missing start code".into()))?;
            self.pos += 1;

            if byte == b':' {
                break;
            }
            if byte != b'\n' && byte != b'\r' {
                error!("Unexpected character ({byte:#04x}).");
                return Err(Error::DataFormat("unexpected character".into()));
            }
        }

        let len = 6 + payload.len() * 2;
        let ascii = self
            .contents
            .get(self.pos..self.pos + len)
            .ok_or_else(|| Error::DataFormat("truncated record".into()))?;
        self.pos += len;

        let mut faddr_bytes = [0u8; 3];
        bytes::hex2bin(&ascii[..6], &mut faddr_bytes).ok_or_else(|| {
            error!("Invalid hexadecimal character.");
            Error::DataFormat("invalid hexadecimal character".into())
        })?;

        let faddr = bytes::u24_be(&faddr_bytes) as usize;
        if faddr != addr {
            error!("Unexpected address ({faddr:#08x}, {addr:#08x}).");
            return Err(Error::DataFormat("record address mismatch".into()));
        }

        bytes::hex2bin(&ascii[6..], payload).ok_or_else(|| {
            error!("Invalid hexadecimal character.");
            Error::DataFormat("invalid hexadecimal character".into())
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    fn encrypt_block(block: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(GenericArray::from_slice(&OSTC3_KEY));
        let mut out = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut out);
        out.into()
    }

    fn push_record(file: &mut String, addr: usize, payload: &[u8]) {
        write!(file, ":{addr:06X}").unwrap();
        for byte in payload {
            write!(file, "{byte:02X}").unwrap();
        }
        file.push('\n');
    }

    /// Build a syntactically valid, correctly encrypted firmware file for a
    /// chosen plaintext.
    fn build_file(plaintext: &[u8]) -> String {
        assert_eq!(plaintext.len(), SZ_FIRMWARE);

        let iv = [0x42u8; 16];
        let mut file = String::new();
        push_record(&mut file, 0, &iv);

        let mut keystream = encrypt_block(&iv);
        let mut addr = 16;
        for block in plaintext.chunks(16) {
            let mut encrypted = [0u8; 16];
            for i in 0..16 {
                encrypted[i] = block[i] ^ keystream[i];
            }
            push_record(&mut file, addr, &encrypted);
            keystream = encrypt_block(&encrypted);
            addr += 16;
        }

        let checksum = checksum::fletcher16_u32(plaintext);
        push_record(&mut file, addr, &checksum.to_le_bytes());

        file
    }

    #[test]
    fn test_decrypt_round_trip() {
        let plaintext: Vec<u8> = (0..SZ_FIRMWARE).map(|i| (i * 7 % 251) as u8).collect();
        let file = build_file(&plaintext);

        let firmware = FirmwareImage::from_bytes(file.as_bytes()).unwrap();
        assert_eq!(firmware.data(), &plaintext[..]);
        assert_eq!(firmware.checksum(), checksum::fletcher16_u32(&plaintext));
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let plaintext = vec![0xA5u8; SZ_FIRMWARE];
        let mut file = build_file(&plaintext);

        // Corrupt the stored checksum (the last record's payload).
        let tail = file.rfind(':').unwrap();
        let replacement = if &file[tail + 7..tail + 9] == "00" { "01" } else { "00" };
        file.replace_range(tail + 7..tail + 9, replacement);

        let result = FirmwareImage::from_bytes(file.as_bytes());
        assert!(matches!(
            result,
            Err(Error::DataFormat(msg)) if msg.contains("checksum")
        ));
    }

    #[test]
    fn test_address_mismatch_is_rejected() {
        let plaintext = vec![0x00u8; SZ_FIRMWARE];
        let mut file = build_file(&plaintext);

        // Swap the second record's address.
        let second = file[1..].find(':').unwrap() + 1;
        file.replace_range(second + 1..second + 7, "000020");

        let result = FirmwareImage::from_bytes(file.as_bytes());
        assert!(matches!(
            result,
            Err(Error::DataFormat(msg)) if msg.contains("address")
        ));
    }

    #[test]
    fn test_garbage_start_code_is_rejected() {
        let result = FirmwareImage::from_bytes(b"x000000");
        assert!(matches!(result, Err(Error::DataFormat(_))));
    }
}
