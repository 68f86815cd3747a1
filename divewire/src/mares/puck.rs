//! Mares Puck (and the Nemo Wide / Nemo Air / Puck Air siblings).
//!
//! Memory-mapped family: a paged read command is the only primitive, and
//! dives are extracted from a full dump. The exact sub-model is identified
//! by byte 1 of page 0 and selects the memory layout; unknown models fall
//! back to the Puck layout.
//!
//! Read framing: `[0x51][addr_lo][addr_hi][count]`, echoed verbatim,
//! followed by the payload and an XOR checksum over the payload.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};

use crate::bytes;
use crate::checksum;
use crate::context::{Context, DevInfo, Event};
use crate::device::{self, CancelToken, Device, Dive, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::family::Family;
use crate::port::{DataBits, FlowControl, Parity, Port, Queue, StopBits};
use crate::ringbuffer;

const CMD_READ: u8 = 0x51;

const PACKETSIZE: usize = 0x20;
const SZ_FINGERPRINT: usize = 5;

/// Offset of the end-of-profile pointer in the configuration page.
const EOP_POINTER: usize = 0x000A;

// Model bytes.
const NEMOWIDE: u8 = 1;
const NEMOAIR: u8 = 4;
const PUCK: u8 = 7;
const PUCKAIR: u8 = 19;

/// Memory geometry of one sub-model.
#[derive(Debug)]
pub(crate) struct Layout {
    memsize: u32,
    rb_profile_begin: u32,
    rb_profile_end: u32,
    rb_freedives_begin: u32,
    rb_freedives_end: u32,
}

static PUCK_LAYOUT: Layout = Layout {
    memsize: 0x4000,
    rb_profile_begin: 0x0070,
    rb_profile_end: 0x4000,
    rb_freedives_begin: 0x4000,
    rb_freedives_end: 0x4000,
};

static NEMOAIR_LAYOUT: Layout = Layout {
    memsize: 0x8000,
    rb_profile_begin: 0x0070,
    rb_profile_end: 0x8000,
    rb_freedives_begin: 0x8000,
    rb_freedives_end: 0x8000,
};

static NEMOWIDE_LAYOUT: Layout = Layout {
    memsize: 0x4000,
    rb_profile_begin: 0x0070,
    rb_profile_end: 0x3400,
    rb_freedives_begin: 0x3400,
    rb_freedives_end: 0x4000,
};

fn layout_for_model(model: u8) -> &'static Layout {
    match model {
        NEMOWIDE => &NEMOWIDE_LAYOUT,
        NEMOAIR | PUCKAIR => &NEMOAIR_LAYOUT,
        PUCK => &PUCK_LAYOUT,
        // Unknown, try puck.
        _ => &PUCK_LAYOUT,
    }
}

/// An open session with a Puck-generation device.
pub struct PuckDevice<P: Port> {
    context: Arc<Context>,
    port: P,
    fingerprint: [u8; SZ_FINGERPRINT],
    cancel: CancelToken,
    devinfo: Option<DevInfo>,
    layout: &'static Layout,
}

impl<P: Port> PuckDevice<P> {
    /// Take over an opened port and identify the sub-model.
    pub fn new(context: Arc<Context>, mut port: P) -> Result<Self> {
        port.configure(
            38_400,
            DataBits::Eight,
            Parity::None,
            StopBits::One,
            FlowControl::None,
        )?;
        port.set_timeout(Some(Duration::from_millis(1000)))?;

        // Both control lines stay low on this interface.
        port.set_dtr(false)?;
        port.set_rts(false)?;

        port.flush_queue(Queue::Both)?;

        let mut device = Self {
            context,
            port,
            fingerprint: [0; SZ_FINGERPRINT],
            cancel: CancelToken::new(),
            devinfo: None,
            layout: &PUCK_LAYOUT,
        };

        // Byte 1 of page 0 selects the layout.
        let mut header = [0u8; PACKETSIZE];
        device.read_inner(0, &mut header)?;
        device.layout = layout_for_model(header[1]);

        Ok(device)
    }

    fn read_packet(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        self.cancel.check()?;

        let command = [
            CMD_READ,
            (address & 0xFF) as u8,
            ((address >> 8) & 0xFF) as u8,
            data.len() as u8,
        ];
        self.port.write_all_bytes(&command).map_err(|e| {
            error!("Failed to send the command.");
            e
        })?;

        let mut echo = [0u8; 4];
        self.port.read_all_bytes(&mut echo)?;
        if echo != command {
            error!("Unexpected echo.");
            return Err(Error::Protocol("echo mismatch".into()));
        }

        self.port.read_all_bytes(data)?;

        let mut crc = [0u8; 1];
        self.port.read_all_bytes(&mut crc)?;
        if crc[0] != checksum::xor_u8(data, 0x00) {
            error!("Unexpected answer checksum.");
            return Err(Error::Protocol("answer checksum mismatch".into()));
        }

        Ok(())
    }

    fn read_inner(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        let mut nbytes = 0;
        let mut address = address;
        while nbytes < data.len() {
            let len = PACKETSIZE.min(data.len() - nbytes);
            self.read_packet(address, &mut data[nbytes..nbytes + len])?;
            nbytes += len;
            address += len as u32;
        }
        Ok(())
    }

    fn foreach_inner(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let mut buffer = Vec::new();
        self.dump(&mut buffer)?;

        let devinfo = DevInfo {
            model: u32::from(buffer[1]),
            firmware: 0,
            serial: bytes::u16_be(&buffer[8..]),
        };
        self.devinfo = Some(devinfo);
        self.context.emit(&Event::DevInfo(devinfo));

        extract_dives(self.layout, &self.fingerprint, &buffer, callback)
    }
}

/// Copy a wrapped window `[start, start+len)` of a ring out of the image.
fn ring_window(data: &[u8], begin: u32, end: u32, start: u32, len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(len as usize);
    let mut address = start;
    for _ in 0..len {
        out.push(data[address as usize]);
        address = ringbuffer::increment(address, 1, begin, end);
    }
    out
}

/// Walk one ring of back-to-back dives. Every dive carries a 16-bit length
/// trailer; the end-of-ring pointer addresses the byte after the newest
/// trailer.
fn extract_ring(
    data: &[u8],
    begin: u32,
    end: u32,
    eop: u32,
    fingerprint: &[u8; SZ_FINGERPRINT],
    callback: &mut DiveCallback<'_>,
) -> Result<bool> {
    if eop < begin || eop >= end {
        error!("Invalid ringbuffer pointer detected.");
        return Err(Error::DataFormat("profile pointer out of range".into()));
    }

    let capacity = end - begin;
    let mut remaining = capacity;
    let mut cursor = eop;

    loop {
        if remaining < 2 {
            break;
        }

        let trailer = ringbuffer::decrement(cursor, 2, begin, end);
        let length = bytes::u16_le(&ring_window(data, begin, end, trailer, 2));

        // Uninitialized memory ends the walk.
        if length == 0 || length == 0xFFFF {
            break;
        }

        // Older dives partially overwritten by the ring are unreachable.
        if length + 2 > remaining {
            break;
        }

        if (length as usize) < SZ_FINGERPRINT {
            error!("Dive too short for a fingerprint.");
            return Err(Error::DataFormat("dive blob too short".into()));
        }

        let start = ringbuffer::decrement(trailer, length, begin, end);
        let blob = ring_window(data, begin, end, start, length);

        if blob[..SZ_FINGERPRINT] == fingerprint[..] {
            return Ok(false);
        }

        if !callback(Dive {
            data: &blob,
            fingerprint: &blob[..SZ_FINGERPRINT],
        }) {
            return Ok(false);
        }

        remaining -= length + 2;
        cursor = start;
    }

    Ok(true)
}

/// Split a memory image into dives, newest first: the profile ring, then
/// (where the layout has one) the freedive ring.
pub(crate) fn extract_dives(
    layout: &Layout,
    fingerprint: &[u8; SZ_FINGERPRINT],
    data: &[u8],
    callback: &mut DiveCallback<'_>,
) -> Result<()> {
    if data.len() < layout.memsize as usize {
        return Err(Error::DataFormat("memory image too short".into()));
    }

    let eop = bytes::u16_le(&data[EOP_POINTER..]);
    if !extract_ring(
        data,
        layout.rb_profile_begin,
        layout.rb_profile_end,
        eop,
        fingerprint,
        callback,
    )? {
        return Ok(());
    }

    if layout.rb_freedives_begin < layout.rb_freedives_end {
        let eop = bytes::u16_le(&data[EOP_POINTER + 2..]);
        extract_ring(
            data,
            layout.rb_freedives_begin,
            layout.rb_freedives_end,
            eop,
            fingerprint,
            callback,
        )?;
    }

    Ok(())
}

impl<P: Port> Device for PuckDevice<P> {
    fn family(&self) -> Family {
        Family::MaresPuck
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
        let memsize = self.layout.memsize;
        let mut progress = Progress::new(&context, memsize);

        device::dump_paged(
            buffer,
            memsize as usize,
            PACKETSIZE,
            &mut progress,
            |address, page| self.read_inner(address, page),
        )
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.foreach_inner(callback)
    }

    fn close(&mut self) -> Result<()> {
        debug!("Closing Puck session");
        self.port.close()
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn devinfo(&self) -> Option<DevInfo> {
        self.devinfo
    }
}

#[cfg(feature = "native")]
impl PuckDevice<crate::port::NativePort> {
    /// Open a Puck-generation device on a native serial port.
    pub fn open(context: Arc<Context>, port_name: &str) -> Result<Self> {
        let config = crate::port::SerialConfig::new(port_name, 38_400);
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

    fn scripted_device(memory: Vec<u8>) -> MockPort {
        let mut port = MockPort::new();
        port.respond_with(move |cmd| {
            assert_eq!(cmd[0], CMD_READ);
            let address = usize::from(cmd[1]) | (usize::from(cmd[2]) << 8);
            let len = usize::from(cmd[3]);

            let mut reply = cmd.to_vec(); // echo
            let payload = &memory[address..address + len];
            reply.extend_from_slice(payload);
            reply.push(checksum::xor_u8(payload, 0x00));
            reply
        });
        port
    }

    fn build_memory() -> Vec<u8> {
        let mut memory = vec![0u8; 0x4000];
        memory[1] = PUCK;
        memory[8..10].copy_from_slice(&0x0BADu16.to_be_bytes());

        // Two dives back to back at the start of the profile ring, each
        // 0x30 bytes plus a 2-byte length trailer.
        let begin = 0x0070usize;
        for i in 0..0x30 {
            memory[begin + i] = 0xA0;
            memory[begin + 0x32 + i] = 0xB0;
        }
        memory[begin..begin + SZ_FINGERPRINT].copy_from_slice(&[1, 2, 3, 4, 5]);
        memory[begin + 0x32..begin + 0x32 + SZ_FINGERPRINT]
            .copy_from_slice(&[6, 7, 8, 9, 10]);
        memory[begin + 0x30..begin + 0x32].copy_from_slice(&0x30u16.to_le_bytes());
        memory[begin + 0x62..begin + 0x64].copy_from_slice(&0x30u16.to_le_bytes());

        // End-of-profile pointer: one past the newest trailer.
        memory[EOP_POINTER..EOP_POINTER + 2]
            .copy_from_slice(&((begin + 0x64) as u16).to_le_bytes());

        memory
    }

    #[test]
    fn test_model_selects_layout() {
        let context = Arc::new(Context::new());
        let mut memory = build_memory();
        memory[1] = NEMOWIDE;
        let port = scripted_device(memory);
        let device = PuckDevice::new(context, port).unwrap();
        assert_eq!(device.layout.rb_profile_end, 0x3400);
    }

    #[test]
    fn test_unknown_model_falls_back_to_puck() {
        let context = Arc::new(Context::new());
        let mut memory = build_memory();
        memory[1] = 99;
        let port = scripted_device(memory);
        let device = PuckDevice::new(context, port).unwrap();
        assert_eq!(device.layout.memsize, 0x4000);
    }

    #[test]
    fn test_foreach_newest_first() {
        let context = Arc::new(Context::new());
        let port = scripted_device(build_memory());
        let mut device = PuckDevice::new(context, port).unwrap();

        let mut seen = Vec::new();
        device
            .foreach(&mut |dive: Dive<'_>| {
                seen.push((dive.fingerprint.to_vec(), dive.data.len()));
                true
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![
                (vec![6, 7, 8, 9, 10], 0x30),
                (vec![1, 2, 3, 4, 5], 0x30),
            ]
        );

        let devinfo = device.devinfo().unwrap();
        assert_eq!(devinfo.model, u32::from(PUCK));
        assert_eq!(devinfo.serial, 0x0BAD);
    }

    #[test]
    fn test_fingerprint_skips_known_dives() {
        let context = Arc::new(Context::new());
        let port = scripted_device(build_memory());
        let mut device = PuckDevice::new(context, port).unwrap();

        device.set_fingerprint(&[6, 7, 8, 9, 10]).unwrap();

        let mut calls = 0;
        device
            .foreach(&mut |_dive| {
                calls += 1;
                true
            })
            .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_corrupted_read_checksum() {
        let context = Arc::new(Context::new());
        let mut port = MockPort::new();
        port.respond_with(|cmd| {
            let mut reply = cmd.to_vec();
            let len = usize::from(cmd[3]);
            reply.extend(std::iter::repeat(0u8).take(len));
            reply.push(0xFF); // wrong checksum for all-zero payload
            reply
        });

        let result = PuckDevice::new(context, port);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
