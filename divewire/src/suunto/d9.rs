//! Suunto D9 and relatives (D6, D4, Vyper2 generation and the D4i/D6i/
//! D9tx/DX refresh).
//!
//! Packet protocol over the Suunto USB interface cable: the command is
//! `[opcode][length_be_u16][parameters][xor]`, echoed verbatim by the
//! interface, followed by a response of the same shape. RTS is cleared to
//! transmit and set to receive; DTR powers the interface. The baud rate is
//! not fixed across the generations, so `open` probes a small list with a
//! harmless version query.
//!
//! Dive memory is a 32-64 KiB map with a profile ring buffer; dives are
//! enumerated by dumping the used window of the ring and walking the
//! per-dive trailer pointers backward from the end-of-profile pointer.

use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, error};

use crate::bytes;
use crate::checksum;
use crate::context::{Context, DevInfo, Event};
use crate::device::{CancelToken, Device, Dive, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::family::Family;
use crate::port::{DataBits, FlowControl, Parity, Port, Queue, StopBits};
use crate::ringbuffer::{self, Overlap};

const CMD_READ: u8 = 0x05;
const CMD_WRITE: u8 = 0x06;
const CMD_VERSION: u8 = 0x0F;
const CMD_RESET_MAXDEPTH: u8 = 0x20;

const SZ_PACKET: usize = 0x78;
const SZ_VERSION: usize = 4;
const SZ_FINGERPRINT: usize = 7;

/// Offset of the profile ring pointer block: dive count, end-of-profile
/// and begin-of-data pointers, each 16-bit little-endian.
const RB_POINTERS: u32 = 0x0190;

// Model numbers of the second-generation protocol variants.
const D4I: u8 = 0x19;
const D6I: u8 = 0x1A;
const D9TX: u8 = 0x1B;
const DX: u8 = 0x1C;

/// Per-variant memory geometry. The fingerprint offset is relative to the
/// start of a dive blob and covers the 7-byte timestamp.
#[derive(Debug)]
struct Layout {
    memsize: u32,
    fingerprint: u32,
    serial: u32,
    rb_profile_begin: u32,
    rb_profile_end: u32,
}

static D9_LAYOUT: Layout = Layout {
    memsize: 0x8000,
    fingerprint: 0x0011,
    serial: 0x0023,
    rb_profile_begin: 0x019A,
    rb_profile_end: 0x7FFE,
};

static D9TX_LAYOUT: Layout = Layout {
    memsize: 0x10000,
    fingerprint: 0x0013,
    serial: 0x0024,
    rb_profile_begin: 0x019A,
    rb_profile_end: 0xEBF0,
};

static DX_LAYOUT: Layout = Layout {
    memsize: 0x10000,
    fingerprint: 0x0017,
    serial: 0x0024,
    rb_profile_begin: 0x019A,
    rb_profile_end: 0xEBF0,
};

/// An open session with a D9-generation dive computer.
pub struct D9Device<P: Port> {
    context: Arc<Context>,
    port: P,
    fingerprint: [u8; SZ_FINGERPRINT],
    cancel: CancelToken,
    devinfo: Option<DevInfo>,
    version: [u8; SZ_VERSION],
    layout: &'static Layout,
}

impl<P: Port> D9Device<P> {
    /// Take over an opened port and identify the protocol variant.
    ///
    /// `model` is an optional hint from a previous session that lets the
    /// baud probe start at the right rate.
    pub fn new(context: Arc<Context>, mut port: P, model: u8) -> Result<Self> {
        port.configure(
            9600,
            DataBits::Eight,
            Parity::None,
            StopBits::One,
            FlowControl::None,
        )?;
        port.set_timeout(Some(Duration::from_millis(3000)))?;

        // The DTR line powers the interface; give it time to settle.
        port.set_dtr(true)?;
        port.sleep(Duration::from_millis(100));
        port.flush_queue(Queue::Both)?;

        let mut device = Self {
            context,
            port,
            fingerprint: [0; SZ_FINGERPRINT],
            cancel: CancelToken::new(),
            devinfo: None,
            version: [0; SZ_VERSION],
            layout: &D9_LAYOUT,
        };

        device.autodetect(model).map_err(|e| {
            error!("Failed to identify the protocol variant.");
            e
        })?;

        let model = device.version[0];
        device.layout = if model == D4I || model == D6I || model == D9TX {
            &D9TX_LAYOUT
        } else if model == DX {
            &DX_LAYOUT
        } else {
            &D9_LAYOUT
        };

        Ok(device)
    }

    fn autodetect(&mut self, model: u8) -> Result<()> {
        const BAUDRATES: [u32; 2] = [9600, 115_200];

        // The newer models talk at the higher rate; use the model number as
        // a hint to probe it first.
        let hint = usize::from(model == D4I || model == D6I || model == D9TX || model == DX);

        let mut result = Err(Error::Timeout("no version response".into()));
        for i in 0..BAUDRATES.len() {
            let idx = (hint + i) % BAUDRATES.len();

            self.port
                .configure(
                    BAUDRATES[idx],
                    DataBits::Eight,
                    Parity::None,
                    StopBits::One,
                    FlowControl::None,
                )
                .map_err(|e| {
                    error!("Failed to set the terminal attributes.");
                    e
                })?;

            result = self.read_version();
            if result.is_ok() {
                break;
            }
        }

        result
    }

    /// One protocol turn: send a command, verify the echo, then verify the
    /// response header, echoed parameters and checksum. `payload` is the
    /// size of the variable part at the end of the response.
    fn packet(&mut self, command: &[u8], asize: usize, payload: usize) -> Result<Vec<u8>> {
        self.cancel.check()?;

        // Clear RTS to send the command.
        self.port.set_rts(false)?;

        self.port.write_all_bytes(command).map_err(|e| {
            error!("Failed to send the command.");
            e
        })?;

        let mut echo = vec![0u8; command.len()];
        self.port.read_all_bytes(&mut echo)?;
        if echo != command {
            error!("Unexpected echo.");
            return Err(Error::Protocol("echo mismatch".into()));
        }

        // Set RTS to receive the reply.
        self.port.set_rts(true)?;

        let mut answer = vec![0u8; asize];
        self.port.read_all_bytes(&mut answer)?;

        if answer[0] != command[0] {
            error!("Unexpected answer header.");
            return Err(Error::Protocol("answer opcode mismatch".into()));
        }

        if bytes::u16_be(&answer[1..]) as usize + 4 != asize {
            error!("Unexpected answer size.");
            return Err(Error::Protocol("answer length mismatch".into()));
        }

        // The fixed parameters are echoed back verbatim.
        let nparams = asize - payload - 4;
        if answer[3..3 + nparams] != command[3..3 + nparams] {
            error!("Unexpected answer parameters.");
            return Err(Error::Protocol("answer parameter mismatch".into()));
        }

        let crc = answer[asize - 1];
        let ccrc = checksum::xor_u8(&answer[..asize - 1], 0x00);
        if crc != ccrc {
            error!("Unexpected answer checksum.");
            return Err(Error::Protocol("answer checksum mismatch".into()));
        }

        Ok(answer)
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn make_command(opcode: u8, params: &[u8]) -> Vec<u8> {
        let mut command = Vec::with_capacity(4 + params.len());
        command.push(opcode);
        command.write_u16::<BigEndian>(params.len() as u16).unwrap();
        command.extend_from_slice(params);
        command.push(checksum::xor_u8(&command, 0x00));
        command
    }

    fn read_version(&mut self) -> Result<()> {
        let command = Self::make_command(CMD_VERSION, &[]);
        let answer = self.packet(&command, 4 + SZ_VERSION, SZ_VERSION)?;
        self.version.copy_from_slice(&answer[3..3 + SZ_VERSION]);
        Ok(())
    }

    /// The 4-byte version block (model, firmware) from the last probe.
    pub fn version(&self) -> [u8; SZ_VERSION] {
        self.version
    }

    /// Clear the recorded maximum depth.
    pub fn reset_maxdepth(&mut self) -> Result<()> {
        let command = Self::make_command(CMD_RESET_MAXDEPTH, &[]);
        self.packet(&command, 4, 0)?;
        Ok(())
    }

    fn read_inner(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        let mut nbytes = 0;
        let mut address = address;
        while nbytes < data.len() {
            let len = SZ_PACKET.min(data.len() - nbytes);

            let params = [
                ((address >> 8) & 0xFF) as u8,
                (address & 0xFF) as u8,
                len as u8,
            ];
            let command = Self::make_command(CMD_READ, &params);
            let answer = self.packet(&command, len + 7, len)?;

            data[nbytes..nbytes + len].copy_from_slice(&answer[6..6 + len]);

            nbytes += len;
            address += len as u32;
        }

        Ok(())
    }

    fn write_inner(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut nbytes = 0;
        let mut address = address;
        while nbytes < data.len() {
            let len = SZ_PACKET.min(data.len() - nbytes);

            let mut params = Vec::with_capacity(3 + len);
            params.push(((address >> 8) & 0xFF) as u8);
            params.push((address & 0xFF) as u8);
            params.push(len as u8);
            params.extend_from_slice(&data[nbytes..nbytes + len]);
            let command = Self::make_command(CMD_WRITE, &params);
            self.packet(&command, 7, 0)?;

            nbytes += len;
            address += len as u32;
        }

        Ok(())
    }

    fn emit_devinfo(&mut self) -> Result<()> {
        let mut serial = [0u8; 4];
        self.read_inner(self.layout.serial, &mut serial)?;

        // The serial number is stored as four two-digit groups.
        let serial = serial
            .iter()
            .fold(0u32, |acc, &b| acc * 100 + u32::from(b.min(99)));

        let devinfo = DevInfo {
            model: u32::from(self.version[0]),
            firmware: bytes::u24_be(&self.version[1..]),
            serial,
        };
        self.devinfo = Some(devinfo);
        self.context.emit(&Event::DevInfo(devinfo));
        Ok(())
    }

    fn foreach_inner(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let layout = self.layout;
        let context = Arc::clone(&self.context);
        let mut progress = Progress::new(&context, layout.memsize);

        self.emit_devinfo()?;

        // Profile ring pointers: dive count, end of the newest dive's
        // trailer, start of the oldest dive.
        let mut pointers = [0u8; 8];
        self.read_inner(RB_POINTERS, &mut pointers)?;
        let count = bytes::u16_le(&pointers[0..]);
        let eop = bytes::u16_le(&pointers[2..]);
        let bop = bytes::u16_le(&pointers[4..]);

        if count == 0 {
            progress.set_maximum(12);
            progress.advance(12);
            return Ok(());
        }

        if eop < layout.rb_profile_begin
            || eop >= layout.rb_profile_end
            || bop < layout.rb_profile_begin
            || bop >= layout.rb_profile_end
        {
            error!("Invalid ringbuffer pointer detected.");
            return Err(Error::DataFormat("profile pointer out of range".into()));
        }

        let used = ringbuffer::distance(
            bop,
            eop,
            Overlap::Empty,
            layout.rb_profile_begin,
            layout.rb_profile_end,
        ) as usize;

        progress.set_maximum(12 + used as u32);
        progress.advance(12);

        // Download the used window, unrolled so that index 0 maps to the
        // begin-of-data pointer. A dive crossing the ring boundary becomes
        // contiguous here.
        let mut ring = vec![0u8; used];
        let mut nbytes = 0;
        let mut address = bop;
        while nbytes < used {
            let mut len = SZ_PACKET.min(used - nbytes);
            // Stop at the ring boundary; the next chunk continues in front.
            let to_end = (layout.rb_profile_end - address) as usize;
            if len > to_end {
                len = to_end;
            }

            self.read_inner(address, &mut ring[nbytes..nbytes + len])?;
            progress.advance(len as u32);

            nbytes += len;
            address = ringbuffer::increment(
                address,
                len as u32,
                layout.rb_profile_begin,
                layout.rb_profile_end,
            );
        }

        // Walk the dive trailers backward: every dive ends with a 16-bit
        // pointer to its own first byte.
        let mut end = used;
        for _ in 0..count {
            if end < 2 {
                error!("Invalid ringbuffer pointer detected.");
                return Err(Error::DataFormat("dive trailer out of range".into()));
            }

            let start_addr = bytes::u16_le(&ring[end - 2..]);
            if start_addr < layout.rb_profile_begin || start_addr >= layout.rb_profile_end {
                error!("Invalid ringbuffer pointer detected.");
                return Err(Error::DataFormat("profile pointer out of range".into()));
            }

            let start = ringbuffer::distance(
                bop,
                start_addr,
                Overlap::Empty,
                layout.rb_profile_begin,
                layout.rb_profile_end,
            ) as usize;
            if start > end - 2 {
                error!("Invalid ringbuffer pointer detected.");
                return Err(Error::DataFormat("dive blob out of order".into()));
            }

            let blob = &ring[start..end - 2];

            let fp_offset = layout.fingerprint as usize;
            if blob.len() < fp_offset + SZ_FINGERPRINT {
                error!("Dive too short for a fingerprint.");
                return Err(Error::DataFormat("dive blob too short".into()));
            }
            let fingerprint = &blob[fp_offset..fp_offset + SZ_FINGERPRINT];

            if fingerprint == self.fingerprint {
                return Ok(());
            }

            if !callback(Dive {
                data: blob,
                fingerprint,
            }) {
                return Ok(());
            }

            end = start;
        }

        Ok(())
    }
}

impl<P: Port> Device for D9Device<P> {
    fn family(&self) -> Family {
        Family::SuuntoD9
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

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.write_inner(address, data)
    }

    fn dump(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let context = Arc::clone(&self.context);
        let memsize = self.layout.memsize;
        let mut progress = Progress::new(&context, memsize);

        crate::device::dump_paged(
            buffer,
            memsize as usize,
            SZ_PACKET,
            &mut progress,
            |address, page| self.read_inner(address, page),
        )
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.foreach_inner(callback)
    }

    fn close(&mut self) -> Result<()> {
        debug!("Closing D9 session");
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
impl D9Device<crate::port::NativePort> {
    /// Open a D9-generation device on a native serial port.
    pub fn open(context: Arc<Context>, port_name: &str, model: u8) -> Result<Self> {
        let config = crate::port::SerialConfig::new(port_name, 9600);
        let port = crate::port::NativePort::open(&config).map_err(|e| {
            error!("Failed to open the serial port.");
            e
        })?;
        Self::new(context, port, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    /// Device side of the packet protocol, serving reads and writes from a
    /// memory image.
    fn scripted_device(mut memory: Vec<u8>) -> MockPort {
        let mut port = MockPort::new();
        port.respond_with(move |cmd| {
            let mut reply = cmd.to_vec(); // echo

            match cmd[0] {
                CMD_VERSION => {
                    let mut answer = vec![CMD_VERSION, 0x00, 0x04, 0x0E, 0x01, 0x02, 0x03];
                    answer.push(checksum::xor_u8(&answer, 0x00));
                    reply.extend_from_slice(&answer);
                },
                CMD_READ => {
                    let address = (usize::from(cmd[3]) << 8) | usize::from(cmd[4]);
                    let len = usize::from(cmd[5]);
                    let mut answer = vec![
                        CMD_READ,
                        0x00,
                        (3 + len) as u8,
                        cmd[3],
                        cmd[4],
                        cmd[5],
                    ];
                    answer.extend_from_slice(&memory[address..address + len]);
                    answer.push(checksum::xor_u8(&answer, 0x00));
                    reply.extend_from_slice(&answer);
                },
                CMD_WRITE => {
                    let address = (usize::from(cmd[3]) << 8) | usize::from(cmd[4]);
                    let len = usize::from(cmd[5]);
                    memory[address..address + len].copy_from_slice(&cmd[6..6 + len]);
                    let mut answer = vec![CMD_WRITE, 0x00, 0x03, cmd[3], cmd[4], cmd[5]];
                    answer.push(checksum::xor_u8(&answer, 0x00));
                    reply.extend_from_slice(&answer);
                },
                _ => {},
            }

            reply
        });
        port
    }

    fn build_memory() -> Vec<u8> {
        let mut memory = vec![0u8; 0x8000];

        // Serial number 23 45 67 89 as two-digit groups.
        memory[0x0023..0x0027].copy_from_slice(&[23, 45, 67, 89]);

        // Two dives in the profile ring: each blob is 0x20 bytes followed
        // by a 2-byte trailer pointing at the blob's first byte.
        let bop = 0x019Au32;
        let dive_a = bop; // older
        let dive_b = bop + 0x22; // newer
        let eop = bop + 0x44;

        for i in 0..0x20u32 {
            memory[(dive_a + i) as usize] = 0xA0;
            memory[(dive_b + i) as usize] = 0xB0;
        }
        // Distinct timestamps (the fingerprint field at offset 0x11).
        memory[(dive_a + 0x11) as usize] = 0x01;
        memory[(dive_b + 0x11) as usize] = 0x02;

        memory[(dive_a + 0x20) as usize..(dive_a + 0x22) as usize]
            .copy_from_slice(&(dive_a as u16).to_le_bytes());
        memory[(dive_b + 0x20) as usize..(dive_b + 0x22) as usize]
            .copy_from_slice(&(dive_b as u16).to_le_bytes());

        // Pointer block: count, end-of-profile, begin-of-data.
        memory[0x0190..0x0192].copy_from_slice(&2u16.to_le_bytes());
        memory[0x0192..0x0194].copy_from_slice(&(eop as u16).to_le_bytes());
        memory[0x0194..0x0196].copy_from_slice(&(bop as u16).to_le_bytes());

        memory
    }

    #[test]
    fn test_version_probe_selects_layout() {
        let context = Arc::new(Context::new());
        let port = scripted_device(build_memory());
        let device = D9Device::new(context, port, 0).unwrap();

        assert_eq!(device.version(), [0x0E, 0x01, 0x02, 0x03]);
        assert_eq!(device.layout.memsize, 0x8000);
    }

    #[test]
    fn test_read_command_layout() {
        let context = Arc::new(Context::new());
        let mut memory = build_memory();
        memory[0x1234] = 0x5A;
        let port = scripted_device(memory);
        let mut device = D9Device::new(context, port, 0).unwrap();

        let mut data = [0u8; 1];
        device.read(0x1234, &mut data).unwrap();
        assert_eq!(data[0], 0x5A);

        // [opcode][len_be][addr_hi][addr_lo][count][xor]
        let written = &device.port.written;
        let n = written.len();
        assert_eq!(
            &written[n - 7..],
            &[
                CMD_READ,
                0x00,
                0x03,
                0x12,
                0x34,
                0x01,
                CMD_READ ^ 0x03 ^ 0x12 ^ 0x34 ^ 0x01
            ]
        );
    }

    #[test]
    fn test_corrupted_checksum_is_protocol_error() {
        let context = Arc::new(Context::new());
        let mut port = MockPort::new();
        port.respond_with(|cmd| {
            let mut reply = cmd.to_vec();
            let mut answer = vec![CMD_VERSION, 0x00, 0x04, 0x0E, 0x01, 0x02, 0x03];
            answer.push(checksum::xor_u8(&answer, 0x00) ^ 0xFF); // bad crc
            reply.extend_from_slice(&answer);
            reply
        });

        // Both baud probes see the corrupted frame.
        let result = D9Device::new(context, port, 0);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_foreach_walks_ring_newest_first() {
        let context = Arc::new(Context::new());
        let port = scripted_device(build_memory());
        let mut device = D9Device::new(context, port, 0).unwrap();

        let mut seen = Vec::new();
        device
            .foreach(&mut |dive: Dive<'_>| {
                seen.push((dive.data[0], dive.data.len(), dive.fingerprint[0]));
                true
            })
            .unwrap();

        assert_eq!(seen, vec![(0xB0, 0x20, 0x02), (0xA0, 0x20, 0x01)]);

        let devinfo = device.devinfo().unwrap();
        assert_eq!(devinfo.model, 0x0E);
        assert_eq!(devinfo.serial, 23_45_67_89);
    }

    #[test]
    fn test_write_read_round_trip() {
        let context = Arc::new(Context::new());
        let port = scripted_device(build_memory());
        let mut device = D9Device::new(context, port, 0).unwrap();

        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        device.write(0x2000, &payload).unwrap();

        let mut readback = [0u8; 4];
        device.read(0x2000, &mut readback).unwrap();
        assert_eq!(readback, payload);
    }

    #[test]
    fn test_fingerprint_stops_enumeration() {
        let context = Arc::new(Context::new());
        let port = scripted_device(build_memory());
        let mut device = D9Device::new(context, port, 0).unwrap();

        // Fingerprint of the newest dive.
        let mut fingerprint = [0xB0u8; SZ_FINGERPRINT];
        fingerprint[0] = 0x02;
        device.set_fingerprint(&fingerprint).unwrap();

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
