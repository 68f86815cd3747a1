//! Uwatec Aladin.
//!
//! The Aladin does not answer commands: once the interface is powered
//! through DTR it repeats a 2050-byte transmission of its entire memory,
//! announced by the signature `55 55 55 00`. The wire is LSB-first, so
//! every byte is bit-reversed before anything else, and the transmission
//! ends with an additive 16-bit checksum.
//!
//! Dives are extracted from the image afterwards: a 37-entry logbook of
//! 12-byte records past the profile ring, and a 0x600-byte profile ring
//! scanned backward for 0xFF start markers. The 4-byte dive timestamp
//! doubles as the fingerprint.

use std::sync::Arc;

use log::{debug, error};

use crate::bytes;
use crate::checksum;
use crate::context::{ClockSync, Context, DevInfo, Event};
use crate::datetime;
use crate::device::{CancelToken, Device, Dive, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::family::Family;
use crate::port::{DataBits, FlowControl, Parity, Port, StopBits};
use crate::ringbuffer::{self, Overlap};

const SZ_MEMORY: usize = 2048;

const RB_PROFILE_BEGIN: u32 = 0x000;
const RB_PROFILE_END: u32 = 0x600;

/// The memory image starts with the 4 signature bytes.
const HEADER: usize = 4;

fn rb_profile_next(a: u32) -> u32 {
    ringbuffer::increment(a, 1, RB_PROFILE_BEGIN, RB_PROFILE_END)
}

fn rb_profile_distance(a: u32, b: u32) -> u32 {
    ringbuffer::distance(a, b, Overlap::Empty, RB_PROFILE_BEGIN, RB_PROFILE_END)
}

/// An open session with an Aladin.
pub struct AladinDevice<P: Port> {
    context: Arc<Context>,
    port: P,
    timestamp: u32,
    devtime: u32,
    systime: i64,
    cancel: CancelToken,
    devinfo: Option<DevInfo>,
}

impl<P: Port> AladinDevice<P> {
    /// Take over an opened port.
    pub fn new(context: Arc<Context>, mut port: P) -> Result<Self> {
        port.configure(
            19_200,
            DataBits::Eight,
            Parity::None,
            StopBits::One,
            FlowControl::None,
        )?;

        // The device transmits on its own schedule; block until it does.
        port.set_timeout(None)?;

        // DTR powers the interface, RTS must stay low.
        port.set_dtr(true)?;
        port.set_rts(false)?;

        Ok(Self {
            context,
            port,
            timestamp: 0,
            devtime: 0,
            systime: -1,
            cancel: CancelToken::new(),
            devinfo: None,
        })
    }

    fn dump_inner(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let context = Arc::clone(&self.context);

        buffer.clear();
        buffer.reserve(SZ_MEMORY);

        let mut progress = Progress::new(&context, (SZ_MEMORY + 2) as u32);

        let mut answer = [0u8; SZ_MEMORY + 2];

        // Wait for the transmission signature, resynchronizing on every
        // stray byte.
        let mut i = 0;
        while i < 4 {
            self.cancel.check()?;

            let mut byte = [0u8; 1];
            self.port.read_all_bytes(&mut byte).map_err(|e| {
                error!("Failed to receive the answer.");
                e
            })?;
            answer[i] = byte[0];

            let expected = if i < 3 { 0x55 } else { 0x00 };
            if answer[i] == expected {
                i += 1;
            } else {
                i = 0;
                self.context.emit(&Event::Waiting);
            }
        }

        // Host time at the start of the transmission; paired with the
        // device clock below.
        let now = datetime::now();

        progress.advance(4);

        self.port.read_all_bytes(&mut answer[4..]).map_err(|e| {
            error!("Unexpected EOF in answer.");
            e
        })?;
        progress.advance((SZ_MEMORY + 2 - 4) as u32);

        // The wire is LSB-first.
        bytes::reverse_bits(&mut answer);

        let crc = bytes::u16_le(&answer[SZ_MEMORY..]) as u16;
        let ccrc = checksum::add_u16(&answer[..SZ_MEMORY], 0x0000);
        if ccrc != crc {
            error!("Unexpected answer checksum.");
            return Err(Error::Protocol("image checksum mismatch".into()));
        }

        self.systime = now;
        self.devtime = bytes::u32_be(&answer[HEADER + 0x7F8..]);

        self.context.emit(&Event::Clock(ClockSync {
            systime: self.systime,
            devtime: self.devtime,
        }));

        buffer.extend_from_slice(&answer[..SZ_MEMORY]);

        Ok(())
    }

    fn foreach_inner(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let mut buffer = Vec::with_capacity(SZ_MEMORY);
        self.dump_inner(&mut buffer)?;

        let devinfo = DevInfo {
            model: u32::from(buffer[HEADER + 0x7BC]),
            firmware: 0,
            serial: bytes::u24_be(&buffer[HEADER + 0x7ED..]),
        };
        self.devinfo = Some(devinfo);
        self.context.emit(&Event::DevInfo(devinfo));

        extract_dives(&buffer, self.timestamp, callback)
    }
}

/// Split a memory image into dives, newest first. Each emitted dive is a
/// Memomouse-compatible record: serial, model, the 12-byte logbook entry
/// (timestamp converted to little-endian), a 16-bit profile length and the
/// profile bytes.
pub fn extract_dives(
    data: &[u8],
    timestamp: u32,
    callback: &mut DiveCallback<'_>,
) -> Result<()> {
    if data.len() < SZ_MEMORY {
        return Err(Error::DataFormat("memory image too short".into()));
    }

    // The logbook ring stores at most 37 entries; fewer dives leave stale
    // entries behind.
    let mut ndives = bytes::u16_be(&data[HEADER + 0x7F2..]);
    if ndives > 37 {
        ndives = 37;
    }

    // Index of the newest logbook entry, stored 1-based.
    let eol = (usize::from(data[HEADER + 0x7F4]) + 37 - 1) % 37;

    // End of the profile ring: the pointer addresses the last byte of the
    // newest profile, one short of where the next would start.
    let eop_raw = u32::from(data[HEADER + 0x7F6])
        + ((u32::from(data[HEADER + 0x7F7] & 0x0F) >> 1) << 8);
    if eop_raw >= RB_PROFILE_END {
        error!("Invalid ringbuffer pointer detected.");
        return Err(Error::DataFormat("profile pointer out of range".into()));
    }
    let eop = rb_profile_next(eop_raw);

    // Both rings are walked backward so the newest dives come out first;
    // the dive counter in the image is unreliable for this. The previous
    // pointer tracks the end of the current dive while the current pointer
    // moves back to the preceding 0xFF start marker.
    let mut profiles = true;
    let mut previous = eop;
    let mut current = eop;

    for i in 0..ndives as usize {
        let mut record = vec![0u8; 18 + (RB_PROFILE_END - RB_PROFILE_BEGIN) as usize];

        let offset = ((eol + 37 - i) % 37) * 12 + RB_PROFILE_END as usize;

        record[0..3].copy_from_slice(&data[HEADER + 0x7ED..HEADER + 0x7F0]); // serial
        record[3] = data[HEADER + 0x7BC]; // model
        record[4..16].copy_from_slice(&data[HEADER + offset..HEADER + offset + 12]);
        record[16] = 0;
        record[17] = 0;

        // The Aladin stores the timestamp big-endian; the canonical record
        // uses little-endian.
        bytes::reverse_bytes(&mut record[11..15]);

        let mut len = 0u32;
        if profiles {
            // Search the profile ring for a start marker.
            loop {
                if current == RB_PROFILE_BEGIN {
                    current = RB_PROFILE_END;
                }
                current -= 1;

                if data[HEADER + current as usize] == 0xFF {
                    len = rb_profile_distance(current, previous);
                    previous = current;
                    break;
                }

                if current == eop {
                    break;
                }
            }

            if len >= 1 {
                // Skip the start marker.
                len -= 1;
                let begin = rb_profile_next(current);
                record[16] = (len & 0xFF) as u8;
                record[17] = ((len >> 8) & 0xFF) as u8;
                if begin + len > RB_PROFILE_END {
                    let a = (RB_PROFILE_END - begin) as usize;
                    let b = (begin + len) as usize - RB_PROFILE_END as usize;
                    record[18..18 + a].copy_from_slice(
                        &data[HEADER + begin as usize..HEADER + RB_PROFILE_END as usize],
                    );
                    record[18 + a..18 + a + b].copy_from_slice(&data[HEADER..HEADER + b]);
                } else {
                    record[18..18 + len as usize].copy_from_slice(
                        &data[HEADER + begin as usize..HEADER + (begin + len) as usize],
                    );
                }
            }

            // Once the scan comes back around to the end-of-profile
            // pointer, the remaining logbook entries have no profile data
            // left in the ring.
            if current == eop {
                profiles = false;
            }
        }

        // Dives at or before the configured timestamp are already known.
        let dive_timestamp = bytes::u32_le(&record[11..]);
        if dive_timestamp <= timestamp {
            return Ok(());
        }

        let total = len as usize + 18;
        if !callback(Dive {
            data: &record[..total],
            fingerprint: &record[11..15],
        }) {
            return Ok(());
        }
    }

    Ok(())
}

impl<P: Port> Device for AladinDevice<P> {
    fn family(&self) -> Family {
        Family::UwatecAladin
    }

    fn set_fingerprint(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.timestamp = 0;
        } else if data.len() == 4 {
            self.timestamp = bytes::u32_le(data);
        } else {
            return Err(Error::InvalidArgs("fingerprint must be 4 bytes".into()));
        }
        Ok(())
    }

    fn dump(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        self.dump_inner(buffer)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.foreach_inner(callback)
    }

    fn close(&mut self) -> Result<()> {
        debug!("Closing Aladin session");
        self.port.close()
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn devinfo(&self) -> Option<DevInfo> {
        self.devinfo
    }

    fn clock(&self) -> Option<ClockSync> {
        if self.systime < 0 {
            None
        } else {
            Some(ClockSync {
                systime: self.systime,
                devtime: self.devtime,
            })
        }
    }
}

#[cfg(feature = "native")]
impl AladinDevice<crate::port::NativePort> {
    /// Open an Aladin on a native serial port.
    pub fn open(context: Arc<Context>, port_name: &str) -> Result<Self> {
        let config = crate::port::SerialConfig::new(port_name, 19_200);
        let port = crate::port::NativePort::open(&config).map_err(|e| {
            error!("Failed to open the serial port.");
            e
        })?;
        Self::new(context, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    /// Build a plausible post-decode memory image: one dive whose profile
    /// sits at the start of the ring. The signature is stored bit-reversed
    /// because the raw wire bytes are 0x55 0x55 0x55 0x00.
    fn build_image() -> Vec<u8> {
        let mut image = vec![0u8; SZ_MEMORY];
        image[0..4].copy_from_slice(&[0xAA, 0xAA, 0xAA, 0x00]);

        // Profile ring: a start marker at 0x000, then 0x20 profile bytes;
        // eop pointer addresses the last profile byte (0x020).
        image[HEADER] = 0xFF;
        for i in 0..0x20 {
            image[HEADER + 1 + i] = 0x10 + i as u8;
        }
        image[HEADER + 0x7F6] = 0x20;
        image[HEADER + 0x7F7] = 0x00;

        // One dive, newest logbook entry index 1 (1-based).
        image[HEADER + 0x7F2..HEADER + 0x7F4].copy_from_slice(&1u16.to_be_bytes());
        image[HEADER + 0x7F4] = 1;

        // Logbook entry 0 with a big-endian timestamp at record offset 7.
        let entry = RB_PROFILE_END as usize;
        image[HEADER + entry + 7..HEADER + entry + 11]
            .copy_from_slice(&0x0102_0304u32.to_be_bytes());

        // Identity: model and 24-bit serial.
        image[HEADER + 0x7BC] = 0x1E;
        image[HEADER + 0x7ED..HEADER + 0x7F0].copy_from_slice(&[0x01, 0x02, 0x03]);

        // Device clock.
        image[HEADER + 0x7F8..HEADER + 0x7FC].copy_from_slice(&0x0055_AA99u32.to_be_bytes());

        image
    }

    /// Encode an image the way the device sends it: bit-reversed with a
    /// trailing checksum.
    fn encode_transmission(image: &[u8]) -> Vec<u8> {
        let crc = checksum::add_u16(image, 0x0000);
        let mut wire = image.to_vec();
        wire.extend_from_slice(&crc.to_le_bytes());
        bytes::reverse_bits(&mut wire);
        wire
    }

    #[test]
    fn test_dump_decodes_and_verifies() {
        let context = Arc::new(Context::new());
        let waiting = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = std::sync::Arc::clone(&waiting);
        context.set_event_handler(move |event| {
            if matches!(event, Event::Waiting) {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        });

        let mut port = MockPort::new();
        // Garbage before the signature exercises the resync path.
        let mut wire = vec![0x00u8, 0x13];
        wire.extend(encode_transmission(&build_image()));
        // Pre-queue: the Aladin talks without being asked.
        port.queue_input(&wire);

        let mut device = AladinDevice::new(Arc::clone(&context), port).unwrap();
        let mut buffer = Vec::new();
        device.dump(&mut buffer).unwrap();

        assert_eq!(buffer.len(), SZ_MEMORY);
        assert_eq!(&buffer[..4], &[0xAA, 0xAA, 0xAA, 0x00]);

        // One Waiting event per stray byte before the signature.
        assert_eq!(waiting.load(std::sync::atomic::Ordering::Relaxed), 2);

        let clock = device.clock().unwrap();
        assert_eq!(clock.devtime, 0x0055_AA99);
    }

    #[test]
    fn test_corrupted_checksum() {
        let context = Arc::new(Context::new());
        let mut port = MockPort::new();
        let mut wire = encode_transmission(&build_image());
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        port.queue_input(&wire);

        let mut device = AladinDevice::new(context, port).unwrap();
        let mut buffer = Vec::new();
        assert!(matches!(
            device.dump(&mut buffer),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_foreach_emits_newest_dive() {
        let context = Arc::new(Context::new());
        let mut port = MockPort::new();
        port.queue_input(&encode_transmission(&build_image()));

        let mut device = AladinDevice::new(context, port).unwrap();
        let mut dives = Vec::new();
        device
            .foreach(&mut |dive: Dive<'_>| {
                dives.push((dive.data.to_vec(), dive.fingerprint.to_vec()));
                true
            })
            .unwrap();

        assert_eq!(dives.len(), 1);
        let (record, fingerprint) = &dives[0];

        // Serial + model prefix.
        assert_eq!(&record[0..3], &[0x01, 0x02, 0x03]);
        assert_eq!(record[3], 0x1E);
        // Timestamp converted to little-endian; it doubles as fingerprint.
        assert_eq!(&record[11..15], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(fingerprint, &vec![0x04, 0x03, 0x02, 0x01]);
        // Profile length (0x20 bytes behind the marker).
        assert_eq!(bytes::u16_le(&record[16..]), 0x20);
        assert_eq!(record.len(), 18 + 0x20);
        assert_eq!(record[18], 0x10);
        assert_eq!(record[18 + 0x1F], 0x2F);

        let devinfo = device.devinfo().unwrap();
        assert_eq!(devinfo.model, 0x1E);
        assert_eq!(devinfo.serial, 0x010203);
    }

    #[test]
    fn test_fingerprint_timestamp_stops() {
        let context = Arc::new(Context::new());
        let mut port = MockPort::new();
        port.queue_input(&encode_transmission(&build_image()));

        let mut device = AladinDevice::new(context, port).unwrap();
        // The dive's timestamp itself: nothing newer exists.
        device
            .set_fingerprint(&[0x04, 0x03, 0x02, 0x01])
            .unwrap();

        let mut calls = 0;
        device
            .foreach(&mut |_dive| {
                calls += 1;
                true
            })
            .unwrap();
        assert_eq!(calls, 0);
    }
}
