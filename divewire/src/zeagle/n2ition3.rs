//! Zeagle N2iTiON3.
//!
//! Length-checksum framing: every command is echoed, then the device
//! answers `[0x02][length_le_u16][payload][checksum][0x03]` where the
//! checksum is the two's complement of the additive sum of the payload.
//! The memory read opcode is 0x4D with a little-endian address and a count
//! embedded in the command, itself protected by the same checksum.
//!
//! The logbook ring holds at most 60 entries of profile start pointers;
//! the profile ring is reassembled backward from the end-of-profile
//! pointer, 64 bytes at a time, so enumeration can stop early at the
//! fingerprint without reading the older dives.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};

use crate::bytes;
use crate::checksum;
use crate::context::Context;
use crate::device::{self, CancelToken, Device, Dive, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::family::Family;
use crate::port::{DataBits, FlowControl, Parity, Port, Queue, StopBits};
use crate::ringbuffer::{self, Overlap};

const SZ_MEMORY: usize = 0x8000;
const SZ_PACKET: usize = 64;
const SZ_FINGERPRINT: usize = 16;

const RB_PROFILE_BEGIN: u32 = 0x3FA0;
const RB_PROFILE_END: u32 = 0x7EC0;

const RB_LOGBOOK_OFFSET: u32 = 0x7EC0;
const RB_LOGBOOK_BEGIN: u32 = 0;
const RB_LOGBOOK_END: u32 = 60;

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

/// Additive checksum, two's complement.
fn complement_sum(data: &[u8]) -> u8 {
    (!checksum::add_u8(data, 0x00)).wrapping_add(1)
}

/// An open session with an N2iTiON3.
pub struct N2ition3Device<P: Port> {
    context: Arc<Context>,
    port: P,
    fingerprint: [u8; SZ_FINGERPRINT],
    cancel: CancelToken,
}

impl<P: Port> N2ition3Device<P> {
    /// Take over an opened port and run the init handshake.
    pub fn new(context: Arc<Context>, mut port: P) -> Result<Self> {
        port.configure(
            4800,
            DataBits::Eight,
            Parity::None,
            StopBits::One,
            FlowControl::None,
        )?;
        port.set_timeout(Some(Duration::from_millis(1000)))?;

        port.flush_queue(Queue::Both)?;

        let mut device = Self {
            context,
            port,
            fingerprint: [0; SZ_FINGERPRINT],
            cancel: CancelToken::new(),
        };

        // The device ignores a failed handshake; so do we.
        let _ = device.init();

        Ok(device)
    }

    fn init(&mut self) -> Result<Vec<u8>> {
        let command = [0x02, 0x01, 0x00, 0x41, 0xBF, 0x03];
        self.packet(&command, 8)
    }

    /// One exchange: the echoed command followed by an STX/ETX frame
    /// carrying `framed` payload bytes.
    fn packet(&mut self, command: &[u8], framed: usize) -> Result<Vec<u8>> {
        self.cancel.check()?;

        self.port.write_all_bytes(command).map_err(|e| {
            error!("Failed to send the command.");
            e
        })?;

        let csize = command.len();
        let asize = csize + framed + 5;
        let mut answer = vec![0u8; asize];
        self.port.read_all_bytes(&mut answer)?;

        if answer[..csize] != *command {
            error!("Unexpected echo.");
            return Err(Error::Protocol("echo mismatch".into()));
        }

        if answer[csize] != STX || answer[asize - 1] != ETX {
            error!("Unexpected answer header/trailer byte.");
            return Err(Error::Protocol("frame delimiter mismatch".into()));
        }

        if bytes::u16_le(&answer[csize + 1..]) as usize + csize + 5 != asize {
            error!("Unexpected answer size.");
            return Err(Error::Protocol("answer length mismatch".into()));
        }

        let crc = answer[asize - 2];
        let ccrc = complement_sum(&answer[csize + 3..asize - 2]);
        if crc != ccrc {
            error!("Unexpected answer checksum.");
            return Err(Error::Protocol("answer checksum mismatch".into()));
        }

        Ok(answer)
    }

    fn read_inner(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        let mut nbytes = 0;
        let mut address = address;
        while nbytes < data.len() {
            let len = SZ_PACKET.min(data.len() - nbytes);

            let mut command = [
                0x02,
                0x08,
                0x00,
                0x4D,
                (address & 0xFF) as u8,
                ((address >> 8) & 0xFF) as u8,
                len as u8,
                0x00,
                0x00,
                0x00,
                0x00,
                0x00,
                0x03,
            ];
            command[11] = complement_sum(&command[3..11]);

            // The framed payload is the status byte plus the data.
            let answer = self.packet(&command, len + 1)?;
            data[nbytes..nbytes + len].copy_from_slice(&answer[17..17 + len]);

            nbytes += len;
            address += len as u32;
        }

        Ok(())
    }

    fn foreach_inner(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let context = Arc::clone(&self.context);
        let config_size = ((RB_LOGBOOK_END - RB_LOGBOOK_BEGIN) * 2 + 8) as usize;
        let mut progress = Progress::new(
            &context,
            config_size as u32 + (RB_PROFILE_END - RB_PROFILE_BEGIN),
        );

        // The configuration area holds the logbook ring and its pointers.
        let mut config = vec![0u8; config_size];
        self.read_inner(RB_LOGBOOK_OFFSET, &mut config).map_err(|e| {
            error!("Failed to read the configuration data.");
            e
        })?;

        let last = u32::from(config[0x7C]);
        let first = u32::from(config[0x7D]);
        if first < RB_LOGBOOK_BEGIN
            || first >= RB_LOGBOOK_END
            || last < RB_LOGBOOK_BEGIN
            || last >= RB_LOGBOOK_END
        {
            if last == 0xFF {
                // Freshly erased device.
                return Ok(());
            }
            error!("Invalid ringbuffer pointer detected.");
            return Err(Error::DataFormat("logbook pointer out of range".into()));
        }

        let mut count =
            ringbuffer::distance(first, last, Overlap::Empty, RB_LOGBOOK_BEGIN, RB_LOGBOOK_END)
                + 1;

        let eop = bytes::u16_le(&config[0x7E..]);
        if eop < RB_PROFILE_BEGIN || eop >= RB_PROFILE_END {
            error!("Invalid ringbuffer pointer detected.");
            return Err(Error::DataFormat("profile pointer out of range".into()));
        }

        // The logbook can hold 60 entries, but the profile ring may wrap
        // earlier when the dives are large. Walking the total length finds
        // how many of the newest dives still have intact profile data.
        let mut total = 0u32;
        let mut idx = last;
        let mut previous = eop;
        for i in 0..count {
            let current = bytes::u16_le(&config[(2 * idx) as usize..]);
            if current < RB_PROFILE_BEGIN || current >= RB_PROFILE_END {
                error!("Invalid ringbuffer pointer detected.");
                return Err(Error::DataFormat("profile pointer out of range".into()));
            }

            let length = ringbuffer::distance(
                current,
                previous,
                Overlap::Full,
                RB_PROFILE_BEGIN,
                RB_PROFILE_END,
            );

            if total + length > RB_PROFILE_END - RB_PROFILE_BEGIN {
                count = i;
                break;
            }

            total += length;
            previous = current;

            if idx == RB_LOGBOOK_BEGIN {
                idx = RB_LOGBOOK_END;
            }
            idx -= 1;
        }

        progress.advance(config_size as u32);
        progress.set_maximum(config_size as u32 + total);

        // Reassembly buffer, filled from the back so each dive is
        // contiguous once its reads complete.
        let capacity = (RB_PROFILE_END - RB_PROFILE_BEGIN) as usize;
        let mut buffer = vec![0u8; capacity];

        let mut available = 0u32;
        let mut remaining = total;
        let mut offset = capacity;

        let mut idx = last;
        let mut previous = eop;
        let mut address = previous;
        for _ in 0..count {
            let current = bytes::u16_le(&config[(2 * idx) as usize..]);

            let length = ringbuffer::distance(
                current,
                previous,
                Overlap::Full,
                RB_PROFILE_BEGIN,
                RB_PROFILE_END,
            );

            let mut nbytes = available;
            while nbytes < length {
                if address == RB_PROFILE_BEGIN {
                    address = RB_PROFILE_END;
                }

                let mut len = SZ_PACKET as u32;
                if RB_PROFILE_BEGIN + len > address {
                    len = address - RB_PROFILE_BEGIN; // End of ringbuffer.
                }
                if nbytes + len > remaining {
                    len = remaining - nbytes; // End of profile.
                }

                address -= len;
                offset -= len as usize;

                self.read_inner(address, &mut buffer[offset..offset + len as usize])
                    .map_err(|e| {
                        error!("Failed to read the memory page.");
                        e
                    })?;

                progress.advance(len);

                nbytes += len;
            }

            remaining -= length;
            available = nbytes - length;
            previous = current;

            let dive = &buffer[offset + available as usize..offset + nbytes as usize];

            if dive[..SZ_FINGERPRINT] == self.fingerprint {
                return Ok(());
            }

            if !callback(Dive {
                data: dive,
                fingerprint: &dive[..SZ_FINGERPRINT],
            }) {
                return Ok(());
            }

            if idx == RB_LOGBOOK_BEGIN {
                idx = RB_LOGBOOK_END;
            }
            idx -= 1;
        }

        Ok(())
    }
}

impl<P: Port> Device for N2ition3Device<P> {
    fn family(&self) -> Family {
        Family::ZeagleN2ition3
    }

    fn set_fingerprint(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.fingerprint = [0; SZ_FINGERPRINT];
        } else if data.len() == SZ_FINGERPRINT {
            self.fingerprint.copy_from_slice(data);
        } else {
            return Err(Error::InvalidArgs(format!(
                "fingerprint must be {SZ_FINGERPRINT} bytes"
            )));
        }
        Ok(())
    }

    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        self.read_inner(address, data)
    }

    fn dump(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let context = Arc::clone(&self.context);
        let mut progress = Progress::new(&context, SZ_MEMORY as u32);

        device::dump_paged(buffer, SZ_MEMORY, SZ_PACKET, &mut progress, |address, page| {
            self.read_inner(address, page)
        })
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.foreach_inner(callback)
    }

    fn close(&mut self) -> Result<()> {
        debug!("Closing N2iTiON3 session");
        self.port.close()
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

#[cfg(feature = "native")]
impl N2ition3Device<crate::port::NativePort> {
    /// Open an N2iTiON3 on a native serial port.
    pub fn open(context: Arc<Context>, port_name: &str) -> Result<Self> {
        let config = crate::port::SerialConfig::new(port_name, 4800);
        let port = crate::port::NativePort::open(&config).map_err(|e| {
            error!("Failed to open the serial port.");
            e
        })?;
        Self::new(context, port)
    }
}
