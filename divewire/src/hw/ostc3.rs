//! Heinrichs Weikamp OSTC3 (and OSTC Sport).
//!
//! The wire discipline matches the Frog: single command bytes, echo,
//! payload, ready byte. On top of that the OSTC3 has three protocol
//! states. A fresh session is `Open`; the first download command moves it
//! to `Download`, a service handshake moves it to `Service`. Service mode
//! accepts every download command (so no transition back is needed), but
//! `Download` cannot be promoted to `Service`. A firmware upgrade leaves
//! the device `Rebooting`, after which only `close` makes sense.
//!
//! In service mode the ready byte changes from 0x4D to 0x4C.

use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use log::{debug, error, warn};

use crate::bytes;
use crate::context::{Context, DevInfo, Event};
use crate::device::{CancelToken, Device, Dive, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::family::Family;
use crate::hw::firmware::FirmwareImage;
use crate::port::{DataBits, FlowControl, Parity, Port, Queue, StopBits};

const S_BLOCK_READ: u8 = 0x20;
const S_BLOCK_WRITE: u8 = 0x30;
const S_ERASE: u8 = 0x42;
const S_READY: u8 = 0x4C;
const READY: u8 = 0x4D;
const S_UPGRADE: u8 = 0x50;
const HEADER: u8 = 0x61;
const CLOCK: u8 = 0x62;
const CUSTOMTEXT: u8 = 0x63;
const COMPACT: u8 = 0x6D;
const DIVE: u8 = 0x66;
const IDENTITY: u8 = 0x69;
const HARDWARE: u8 = 0x6A;
const DISPLAY: u8 = 0x6E;
const READ: u8 = 0x72;
const WRITE: u8 = 0x77;
const RESET: u8 = 0x78;
const INIT: u8 = 0xBB;
const EXIT: u8 = 0xFF;

const SZ_DISPLAY: usize = 16;
const SZ_CUSTOMTEXT: usize = 60;
const SZ_VERSION: usize = SZ_CUSTOMTEXT + 4;
const SZ_HARDWARE: usize = 1;
const SZ_CONFIG: usize = 4;
const SZ_MEMORY: usize = 0x40_0000;
const SZ_FINGERPRINT: usize = 5;

/// Firmware lives in its own flash area, written in 4 KiB blocks.
pub(crate) const SZ_FIRMWARE_BLOCK: usize = 0x1000;
pub(crate) const FIRMWARE_AREA: u32 = 0x3E_0000;

const RB_LOGBOOK_SIZE_COMPACT: usize = 16;
const RB_LOGBOOK_SIZE_FULL: usize = 256;
const RB_LOGBOOK_COUNT: usize = 256;

// Model numbers reported in the hardware descriptor.
const OSTC3: u32 = 0x0A;
const SPORT: u32 = 0x12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Download,
    Service,
    Rebooting,
}

/// Field offsets within one logbook header entry.
struct LogbookLayout {
    size: usize,
    profile: usize,
    fingerprint: usize,
    number: usize,
}

const LOGBOOK_COMPACT: LogbookLayout = LogbookLayout {
    size: RB_LOGBOOK_SIZE_COMPACT,
    profile: 0,
    fingerprint: 3,
    number: 13,
};

const LOGBOOK_FULL: LogbookLayout = LogbookLayout {
    size: RB_LOGBOOK_SIZE_FULL,
    profile: 9,
    fingerprint: 12,
    number: 80,
};

/// An open session with an OSTC3.
pub struct Ostc3Device<P: Port> {
    context: Arc<Context>,
    port: P,
    fingerprint: [u8; SZ_FINGERPRINT],
    cancel: CancelToken,
    devinfo: Option<DevInfo>,
    state: State,
}

impl<P: Port> Ostc3Device<P> {
    /// Take over an opened port. The device stays in the `Open` state until
    /// the first command selects download or service mode.
    pub fn new(context: Arc<Context>, mut port: P) -> Result<Self> {
        port.configure(
            115_200,
            DataBits::Eight,
            Parity::None,
            StopBits::One,
            FlowControl::None,
        )?;
        port.set_timeout(Some(Duration::from_millis(3000)))?;

        port.sleep(Duration::from_millis(300));
        port.flush_queue(Queue::Both)?;

        Ok(Self {
            context,
            port,
            fingerprint: [0; SZ_FINGERPRINT],
            cancel: CancelToken::new(),
            devinfo: None,
            state: State::Open,
        })
    }

    fn ready_byte(&self) -> u8 {
        if self.state == State::Service {
            S_READY
        } else {
            READY
        }
    }

    fn transfer(
        &mut self,
        mut progress: Option<&mut Progress<'_>>,
        cmd: u8,
        input: Option<&[u8]>,
        output: &mut [u8],
    ) -> Result<()> {
        self.cancel.check()?;

        let ready = self.ready_byte();

        self.port.write_all_bytes(&[cmd]).map_err(|e| {
            error!("Failed to send the command.");
            e
        })?;

        let mut echo = [0u8; 1];
        self.port.read_all_bytes(&mut echo)?;
        if echo[0] != cmd {
            // A bare ready byte instead of the echo means the firmware does
            // not know the command.
            if echo[0] == ready {
                error!("Unsupported command.");
                return Err(Error::Unsupported(format!("command {cmd:#04x}")));
            }
            error!("Unexpected echo.");
            return Err(Error::Protocol(format!(
                "unexpected echo {:#04x} for command {cmd:#04x}",
                echo[0]
            )));
        }

        if let Some(input) = input {
            self.port.write_all_bytes(input)?;
        }

        let mut nbytes = 0;
        while nbytes < output.len() {
            let mut len = 1024;
            let available = self.port.bytes_available()?;
            if available > len {
                len = available;
            }
            if nbytes + len > output.len() {
                len = output.len() - nbytes;
            }

            self.port.read_all_bytes(&mut output[nbytes..nbytes + len])?;

            if let Some(progress) = progress.as_deref_mut() {
                progress.advance(len as u32);
            }

            nbytes += len;
        }

        if cmd != EXIT {
            let mut answer = [0u8; 1];
            self.port.read_all_bytes(&mut answer)?;
            if answer[0] != ready {
                error!("Unexpected ready byte.");
                return Err(Error::Protocol(format!(
                    "unexpected ready byte {:#04x}",
                    answer[0]
                )));
            }
        }

        Ok(())
    }

    fn init_download(&mut self) -> Result<()> {
        self.transfer(None, INIT, None, &mut []).map_err(|e| {
            error!("Failed to send the command.");
            e
        })?;
        self.state = State::Download;
        Ok(())
    }

    fn init_service(&mut self) -> Result<()> {
        self.cancel.check()?;

        // The service handshake has its own echo, so the regular transfer
        // helper does not apply.
        let command = [0xAA, 0xAB, 0xCD, 0xEF];
        self.port.write_all_bytes(&command).map_err(|e| {
            error!("Failed to send the command.");
            e
        })?;

        // Give the device some time to enter service mode.
        self.port.sleep(Duration::from_millis(100));

        let mut output = [0u8; 5];
        self.port.read_all_bytes(&mut output)?;

        if output != [0x4B, 0xAB, 0xCD, 0xEF, S_READY] {
            error!("Failed to verify echo.");
            return Err(Error::Protocol("service handshake rejected".into()));
        }

        self.state = State::Service;
        Ok(())
    }

    fn init(&mut self, state: State) -> Result<()> {
        if self.state == state {
            Ok(())
        } else if self.state == State::Open {
            match state {
                State::Download => self.init_download(),
                State::Service => self.init_service(),
                _ => Err(Error::InvalidArgs("invalid protocol state".into())),
            }
        } else if self.state == State::Service && state == State::Download {
            // Service mode accepts all download commands; no transition
            // needed.
            Ok(())
        } else {
            Err(Error::InvalidArgs(format!(
                "protocol state change {:?} -> {state:?} not possible",
                self.state
            )))
        }
    }

    /// Read the identity block (serial, firmware and custom text).
    pub fn version(&mut self) -> Result<[u8; SZ_VERSION]> {
        self.init(State::Download)?;
        let mut id = [0u8; SZ_VERSION];
        self.transfer(None, IDENTITY, None, &mut id)?;
        Ok(id)
    }

    /// Read the hardware descriptor byte.
    pub fn hardware(&mut self) -> Result<u8> {
        self.init(State::Download)?;
        let mut data = [0u8; SZ_HARDWARE];
        self.transfer(None, HARDWARE, None, &mut data)?;
        Ok(data[0])
    }

    /// Set the device clock.
    pub fn set_clock(&mut self, datetime: &crate::datetime::DateTime) -> Result<()> {
        self.init(State::Download)?;
        let packet = [
            datetime.hour as u8,
            datetime.minute as u8,
            datetime.second as u8,
            datetime.month as u8,
            datetime.day as u8,
            (datetime.year.saturating_sub(2000)) as u8,
        ];
        self.transfer(None, CLOCK, Some(&packet), &mut [])
    }

    /// Show a text message on the device display.
    pub fn display(&mut self, text: &str) -> Result<()> {
        let packet = pad_text::<SZ_DISPLAY>(text)?;
        self.init(State::Download)?;
        self.transfer(None, DISPLAY, Some(&packet), &mut [])
    }

    /// Store the custom text shown in surface mode.
    pub fn customtext(&mut self, text: &str) -> Result<()> {
        let packet = pad_text::<SZ_CUSTOMTEXT>(text)?;
        self.init(State::Download)?;
        self.transfer(None, CUSTOMTEXT, Some(&packet), &mut [])
    }

    /// Read a configuration page (at most 4 bytes).
    pub fn config_read(&mut self, config: u8, data: &mut [u8]) -> Result<()> {
        if data.len() > SZ_CONFIG {
            error!("Invalid parameter specified.");
            return Err(Error::InvalidArgs("config reads are at most 4 bytes".into()));
        }
        self.init(State::Download)?;
        self.transfer(None, READ, Some(&[config]), data)
    }

    /// Write a configuration page (at most 4 bytes).
    pub fn config_write(&mut self, config: u8, data: &[u8]) -> Result<()> {
        if data.len() > SZ_CONFIG {
            error!("Invalid parameter specified.");
            return Err(Error::InvalidArgs("config writes are at most 4 bytes".into()));
        }
        self.init(State::Download)?;
        let mut command = Vec::with_capacity(1 + data.len());
        command.push(config);
        command.extend_from_slice(data);
        self.transfer(None, WRITE, Some(&command), &mut [])
    }

    /// Reset all configuration to factory defaults.
    pub fn config_reset(&mut self) -> Result<()> {
        self.init(State::Download)?;
        self.transfer(None, RESET, None, &mut [])
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn block_read(&mut self, addr: u32, block: &mut [u8]) -> Result<()> {
        let mut buffer = Vec::with_capacity(6);
        buffer.write_u24::<BigEndian>(addr).unwrap();
        buffer.write_u24::<BigEndian>(block.len() as u32).unwrap();
        self.transfer(None, S_BLOCK_READ, Some(&buffer), block)
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn block_write(&mut self, addr: u32, block: &[u8]) -> Result<()> {
        if block.len() > SZ_FIRMWARE_BLOCK {
            return Err(Error::InvalidArgs(format!(
                "firmware blocks are at most {SZ_FIRMWARE_BLOCK} bytes"
            )));
        }
        let mut buffer = Vec::with_capacity(3 + block.len());
        buffer.write_u24::<BigEndian>(addr).unwrap();
        buffer.extend_from_slice(block);
        self.transfer(None, S_BLOCK_WRITE, Some(&buffer), &mut [])
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn erase(&mut self, addr: u32, size: usize) -> Result<()> {
        // Round up to whole pages.
        let blocks = size.div_ceil(SZ_FIRMWARE_BLOCK) as u8;
        let mut buffer = Vec::with_capacity(4);
        buffer.write_u24::<BigEndian>(addr).unwrap();
        buffer.push(blocks);
        self.transfer(None, S_ERASE, Some(&buffer), &mut [])
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn upgrade(&mut self, checksum: u32) -> Result<()> {
        let mut buffer = [0u8; 5];
        (&mut buffer[0..4]).write_u32::<LittleEndian>(checksum).unwrap();

        // One-byte rolling guard so the device can validate the checksum
        // before it reprograms itself.
        buffer[4] = 0x55;
        for i in 0..4 {
            buffer[4] ^= buffer[i];
            buffer[4] = buffer[4].rotate_left(1);
        }

        self.transfer(None, S_UPGRADE, Some(&buffer), &mut [])
            .map_err(|e| {
                error!("Failed to send flash firmware command");
                e
            })?;

        // The device resets and, if all is well, reprograms.
        self.state = State::Rebooting;
        Ok(())
    }

    /// Flash a firmware image: erase, upload, verify, reprogram.
    ///
    /// Requires (and enters) service mode. On success the device is
    /// rebooting and the session is only good for `close`.
    pub fn update_firmware(&mut self, firmware: &FirmwareImage) -> Result<()> {
        let context = Arc::clone(&self.context);

        // Steps: enter service mode, erase, upload, verify, reprogram.
        let blocks = (firmware.data().len() / SZ_FIRMWARE_BLOCK) as u32;
        let mut progress = Progress::new(&context, 3 + blocks * 2);

        self.init(State::Service)?;
        progress.advance(1);

        self.display(" Erasing FW...")?;
        self.erase(FIRMWARE_AREA, firmware.data().len()).map_err(|e| {
            error!("Failed to erase old firmware");
            e
        })?;
        progress.advance(1);

        for (i, block) in firmware.data().chunks(SZ_FIRMWARE_BLOCK).enumerate() {
            let percent = 100 * i / blocks as usize;
            self.display(&format!(" Uploading {percent:2}%"))?;

            self.block_write(FIRMWARE_AREA + (i * SZ_FIRMWARE_BLOCK) as u32, block)
                .map_err(|e| {
                    error!("Failed to write block to device");
                    e
                })?;
            progress.advance(1);
        }

        let mut readback = [0u8; SZ_FIRMWARE_BLOCK];
        for (i, block) in firmware.data().chunks(SZ_FIRMWARE_BLOCK).enumerate() {
            let percent = 100 * i / blocks as usize;
            self.display(&format!(" Verifying {percent:2}%"))?;

            self.block_read(FIRMWARE_AREA + (i * SZ_FIRMWARE_BLOCK) as u32, &mut readback)
                .map_err(|e| {
                    error!("Failed to read block.");
                    e
                })?;
            if readback != *block {
                error!("Failed verify.");
                let _ = self.display(" Verify FAILED");
                return Err(Error::Protocol("firmware verify mismatch".into()));
            }
            progress.advance(1);
        }

        self.display(" Programming...")?;
        self.upgrade(firmware.checksum())?;
        progress.advance(1);

        Ok(())
    }

    fn foreach_inner(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let context = Arc::clone(&self.context);
        let mut progress = Progress::new(&context, SZ_MEMORY as u32);

        self.init(State::Download)?;

        let id = self.version().map_err(|e| {
            error!("Failed to read the version.");
            e
        })?;

        // The hardware descriptor is missing on older firmware.
        let hardware = match self.hardware() {
            Ok(hardware) => u32::from(hardware),
            Err(Error::Unsupported(_)) => 0,
            Err(e) => {
                error!("Failed to read the hardware descriptor.");
                return Err(e);
            },
        };

        let serial = bytes::u16_le(&id[0..]);
        let model = if hardware != 0 {
            hardware
        } else if serial > 10_000 {
            // No descriptor; tell the models apart by serial number range.
            SPORT
        } else {
            OSTC3
        };
        let devinfo = DevInfo {
            model,
            firmware: bytes::u16_be(&id[2..]),
            serial,
        };
        self.devinfo = Some(devinfo);
        self.context.emit(&Event::DevInfo(devinfo));

        // Prefer the compact logbook headers; fall back to the full ones on
        // firmware that predates them.
        let mut header = vec![0u8; RB_LOGBOOK_SIZE_FULL * RB_LOGBOOK_COUNT];
        let mut logbook = &LOGBOOK_COMPACT;
        let rc = self.transfer(
            Some(&mut progress),
            COMPACT,
            None,
            &mut header[..RB_LOGBOOK_SIZE_COMPACT * RB_LOGBOOK_COUNT],
        );
        match rc {
            Ok(()) => {},
            Err(Error::Unsupported(_)) => {
                logbook = &LOGBOOK_FULL;
                self.transfer(Some(&mut progress), HEADER, None, &mut header)
                    .map_err(|e| {
                        error!("Failed to read the header.");
                        e
                    })?;
            },
            Err(e) => {
                error!("Failed to read the header.");
                return Err(e);
            },
        }
        let compact = logbook.size == RB_LOGBOOK_SIZE_COMPACT;

        // Locate the most recent dive by its internal dive number.
        let mut count = 0;
        let mut latest = 0;
        let mut maximum = 0;
        for i in 0..RB_LOGBOOK_COUNT {
            let offset = i * logbook.size;
            let entry = &header[offset..offset + logbook.size];

            if bytes::is_equal(entry, 0xFF) {
                continue;
            }

            let current = bytes::u16_le(&entry[logbook.number..]);
            if current > maximum {
                maximum = current;
                latest = i;
            }

            count += 1;
        }

        let mut ndives = 0;
        let mut size = 0u32;
        let mut maxsize = 0u32;
        for i in 0..count {
            let idx = (latest + RB_LOGBOOK_COUNT - i) % RB_LOGBOOK_COUNT;
            let offset = idx * logbook.size;
            let entry = &header[offset..offset + logbook.size];

            // Dives interleaved with empty entries are not supported.
            if bytes::is_equal(entry, 0xFF) {
                warn!("Unexpected empty header found.");
                break;
            }

            let length = dive_length(entry, logbook, compact);

            if entry[logbook.fingerprint..logbook.fingerprint + SZ_FINGERPRINT]
                == self.fingerprint
            {
                break;
            }

            if length > maxsize {
                maxsize = length;
            }
            size += length;
            ndives += 1;
        }

        progress.set_maximum((logbook.size * RB_LOGBOOK_COUNT) as u32 + size);

        if ndives == 0 {
            return Ok(());
        }

        let mut profile = vec![0u8; maxsize as usize];
        for i in 0..ndives {
            let idx = (latest + RB_LOGBOOK_COUNT - i) % RB_LOGBOOK_COUNT;
            let offset = idx * logbook.size;
            let entry = &header[offset..offset + logbook.size];

            let length = dive_length(entry, logbook, compact) as usize;

            let number = [idx as u8];
            self.transfer(
                Some(&mut progress),
                DIVE,
                Some(&number),
                &mut profile[..length],
            )
            .map_err(|e| {
                error!("Failed to read the dive.");
                e
            })?;

            // With full headers the profile repeats the logbook entry.
            if !compact && profile[..logbook.size] != *entry {
                error!("Unexpected profile header.");
                return Err(Error::Protocol("profile header mismatch".into()));
            }

            let keep_going = callback(Dive {
                data: &profile[..length],
                fingerprint: &profile[LOGBOOK_FULL.fingerprint
                    ..LOGBOOK_FULL.fingerprint + SZ_FINGERPRINT],
            });
            if !keep_going {
                break;
            }
        }

        Ok(())
    }

    fn dump_inner(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let context = Arc::clone(&self.context);
        let mut progress = Progress::new(&context, SZ_MEMORY as u32);

        self.init(State::Service)?;

        buffer.clear();
        buffer.resize(SZ_MEMORY, 0);

        let mut nbytes = 0;
        while nbytes < SZ_MEMORY {
            let len = SZ_FIRMWARE_BLOCK;
            self.block_read(nbytes as u32, &mut buffer[nbytes..nbytes + len])
                .map_err(|e| {
                    error!("Failed to read block.");
                    e
                })?;

            progress.advance(len as u32);
            nbytes += len;
        }

        Ok(())
    }
}

/// Profile length for a logbook entry: a full header plus the 24-bit
/// profile size, minus the 3 pointer bytes. Older firmware (< 93) already
/// excludes the pointer bytes; only full headers carry the version to tell.
fn dive_length(entry: &[u8], logbook: &LogbookLayout, compact: bool) -> u32 {
    let mut length =
        RB_LOGBOOK_SIZE_FULL as u32 + bytes::u24_le(&entry[logbook.profile..]) - 3;
    if !compact {
        let firmware = bytes::u16_be(&entry[0x30..]);
        if firmware < 93 {
            length -= 3;
        }
    }
    length
}

fn pad_text<const N: usize>(text: &str) -> Result<[u8; N]> {
    let text = text.as_bytes();
    if text.len() > N {
        error!("Invalid parameter specified.");
        return Err(Error::InvalidArgs(format!("text longer than {N} bytes")));
    }
    let mut packet = [0x20u8; N];
    packet[..text.len()].copy_from_slice(text);
    Ok(packet)
}

impl<P: Port> Device for Ostc3Device<P> {
    fn family(&self) -> Family {
        Family::HwOstc3
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

    fn dump(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        self.dump_inner(buffer)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.foreach_inner(callback)
    }

    fn close(&mut self) -> Result<()> {
        debug!("Closing OSTC3 session");
        if self.state == State::Download || self.state == State::Service {
            self.transfer(None, EXIT, None, &mut []).map_err(|e| {
                error!("Failed to send the command.");
                e
            })?;
        }
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
impl Ostc3Device<crate::port::NativePort> {
    /// Open an OSTC3 on a native serial port.
    pub fn open(context: Arc<Context>, port_name: &str) -> Result<Self> {
        let config = crate::port::SerialConfig::new(port_name, 115_200);
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

    #[test]
    fn test_service_handshake() {
        let context = Arc::new(Context::new());
        let mut port = MockPort::new();
        port.respond_with(|cmd| match cmd {
            [0xAA, 0xAB, 0xCD, 0xEF] => vec![0x4B, 0xAB, 0xCD, 0xEF, S_READY],
            _ => vec![],
        });

        let mut device = Ostc3Device::new(context, port).unwrap();
        device.init(State::Service).unwrap();
        assert_eq!(device.state, State::Service);

        // Service mode accepts download commands without a transition.
        device.init(State::Download).unwrap();
        assert_eq!(device.state, State::Service);
    }

    #[test]
    fn test_download_to_service_is_rejected() {
        let context = Arc::new(Context::new());
        let mut port = MockPort::new();
        port.respond_with(|cmd| match cmd {
            [INIT] => vec![INIT, READY],
            _ => vec![],
        });

        let mut device = Ostc3Device::new(context, port).unwrap();
        device.init(State::Download).unwrap();
        assert!(matches!(
            device.init(State::Service),
            Err(Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_ready_echo_means_unsupported() {
        let context = Arc::new(Context::new());
        let mut port = MockPort::new();
        port.respond_with(|cmd| match cmd {
            [INIT] => vec![INIT, READY],
            // The device answers a bare ready byte to unknown commands.
            [COMPACT] => vec![READY],
            _ => vec![],
        });

        let mut device = Ostc3Device::new(context, port).unwrap();
        device.init(State::Download).unwrap();

        let mut out = [0u8; 16];
        let rc = device.transfer(None, COMPACT, None, &mut out);
        assert!(matches!(rc, Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_block_read_command_layout() {
        let context = Arc::new(Context::new());
        let mut port = MockPort::new();
        port.respond_with(|cmd| match cmd {
            [0xAA, 0xAB, 0xCD, 0xEF] => vec![0x4B, 0xAB, 0xCD, 0xEF, S_READY],
            [S_BLOCK_READ] => vec![S_BLOCK_READ],
            [_, _, _, _, _, _] => {
                let mut reply = vec![0xEE; 8];
                reply.push(S_READY);
                reply
            },
            _ => vec![],
        });

        let mut device = Ostc3Device::new(context, port).unwrap();
        device.init(State::Service).unwrap();

        let mut block = [0u8; 8];
        device.block_read(0x3E0010, &mut block).unwrap();
        assert_eq!(block, [0xEE; 8]);

        // Command byte, then 24-bit address and length, big-endian.
        let written = &device.port.written;
        let n = written.len();
        assert_eq!(&written[n - 7..], &[S_BLOCK_READ, 0x3E, 0x00, 0x10, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn test_upgrade_guard_byte() {
        // Checksum 0 gives a pure rotation of the 0x55 seed.
        let mut buffer = [0u8; 5];
        buffer[0..4].copy_from_slice(&0u32.to_le_bytes());
        buffer[4] = 0x55;
        for i in 0..4 {
            buffer[4] ^= buffer[i];
            buffer[4] = buffer[4].rotate_left(1);
        }
        assert_eq!(buffer[4], 0x55u8.rotate_left(4));
    }
}
