//! Heinrichs Weikamp Frog.
//!
//! Single-byte commands, echoed back by the device, with a ready byte
//! (0x4D) closing every exchange. Dive memory is a 256-slot logbook of
//! 256-byte headers plus a 2 MiB profile ring; downloads are header-first:
//! scan the headers, walk back from the newest internal dive number, fetch
//! each dive with the DIVE command.

use std::sync::Arc;

use log::{debug, error, warn};

use crate::bytes;
use crate::context::{Context, DevInfo, Event};
use crate::device::{CancelToken, Device, Dive, DiveCallback, Progress};
use crate::error::{Error, Result};
use crate::family::Family;
use crate::port::{DataBits, FlowControl, Parity, Port, Queue, StopBits};
use crate::ringbuffer::{self, Overlap};

const READY: u8 = 0x4D;
const HEADER: u8 = 0x61;
const CLOCK: u8 = 0x62;
const CUSTOMTEXT: u8 = 0x63;
const DIVE: u8 = 0x66;
const IDENTITY: u8 = 0x69;
const DISPLAY: u8 = 0x6E;
const INIT: u8 = 0xBB;
const EXIT: u8 = 0xFF;

const SZ_DISPLAY: usize = 15;
const SZ_CUSTOMTEXT: usize = 13;
const SZ_VERSION: usize = SZ_CUSTOMTEXT + 4;
const SZ_FINGERPRINT: usize = 5;

const RB_LOGBOOK_SIZE: usize = 256;
const RB_LOGBOOK_COUNT: usize = 256;

const RB_PROFILE_BEGIN: u32 = 0x000000;
const RB_PROFILE_END: u32 = 0x200000;

fn rb_profile_distance(a: u32, b: u32) -> u32 {
    ringbuffer::distance(a, b, Overlap::Empty, RB_PROFILE_BEGIN, RB_PROFILE_END)
}

/// An open session with a Frog.
pub struct FrogDevice<P: Port> {
    context: Arc<Context>,
    port: P,
    fingerprint: [u8; SZ_FINGERPRINT],
    cancel: CancelToken,
    devinfo: Option<DevInfo>,
}

impl<P: Port> FrogDevice<P> {
    /// Take over an opened port and bring the device into download mode.
    pub fn new(context: Arc<Context>, mut port: P) -> Result<Self> {
        port.configure(
            115_200,
            DataBits::Eight,
            Parity::None,
            StopBits::One,
            FlowControl::None,
        )?;
        port.set_timeout(Some(std::time::Duration::from_millis(3000)))?;

        // Let the device settle before flushing stale bytes.
        port.sleep(std::time::Duration::from_millis(300));
        port.flush_queue(Queue::Both)?;

        let mut device = Self {
            context,
            port,
            fingerprint: [0; SZ_FINGERPRINT],
            cancel: CancelToken::new(),
            devinfo: None,
        };

        device.transfer(None, INIT, None, &mut [])?;

        Ok(device)
    }

    /// Core exchange: command byte, echo, optional payload in both
    /// directions, ready byte. INIT and HEADER are not echoed; EXIT sends
    /// no ready byte.
    fn transfer(
        &mut self,
        mut progress: Option<&mut Progress<'_>>,
        cmd: u8,
        input: Option<&[u8]>,
        output: &mut [u8],
    ) -> Result<()> {
        self.cancel.check()?;

        self.port.write_all_bytes(&[cmd]).map_err(|e| {
            error!("Failed to send the command.");
            e
        })?;

        if cmd != INIT && cmd != HEADER {
            let mut echo = [0u8; 1];
            self.port.read_all_bytes(&mut echo)?;
            if echo[0] != cmd {
                error!("Unexpected echo.");
                return Err(Error::Protocol(format!(
                    "unexpected echo {:#04x} for command {cmd:#04x}",
                    echo[0]
                )));
            }
        }

        if let Some(input) = input {
            self.port.write_all_bytes(input)?;
        }

        let mut nbytes = 0;
        while nbytes < output.len() {
            // Read at least 1 KiB per turn, more if it is already buffered.
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
            if answer[0] != READY {
                error!("Unexpected ready byte.");
                return Err(Error::Protocol(format!(
                    "unexpected ready byte {:#04x}",
                    answer[0]
                )));
            }
        }

        Ok(())
    }

    /// Read the identity block (serial and firmware version).
    pub fn version(&mut self) -> Result<[u8; SZ_VERSION]> {
        let mut id = [0u8; SZ_VERSION];
        self.transfer(None, IDENTITY, None, &mut id)?;
        Ok(id)
    }

    /// Set the device clock.
    pub fn set_clock(&mut self, datetime: &crate::datetime::DateTime) -> Result<()> {
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
        self.transfer(None, DISPLAY, Some(&packet), &mut [])
    }

    /// Store the custom text shown in surface mode.
    pub fn customtext(&mut self, text: &str) -> Result<()> {
        let packet = pad_text::<SZ_CUSTOMTEXT>(text)?;
        self.transfer(None, CUSTOMTEXT, Some(&packet), &mut [])
    }

    fn foreach_inner(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let context = Arc::clone(&self.context);
        let mut progress = Progress::new(
            &context,
            (RB_LOGBOOK_SIZE * RB_LOGBOOK_COUNT) as u32 + (RB_PROFILE_END - RB_PROFILE_BEGIN),
        );

        // Identify the device.
        let id = self.version().map_err(|e| {
            error!("Failed to read the version.");
            e
        })?;

        let devinfo = DevInfo {
            model: 0,
            firmware: bytes::u16_be(&id[2..]),
            serial: bytes::u16_le(&id[0..]),
        };
        self.devinfo = Some(devinfo);
        self.context.emit(&Event::DevInfo(devinfo));

        // Download the logbook headers.
        let mut header = vec![0u8; RB_LOGBOOK_SIZE * RB_LOGBOOK_COUNT];
        self.transfer(Some(&mut progress), HEADER, None, &mut header)
            .map_err(|e| {
                error!("Failed to read the header.");
                e
            })?;

        // Locate the most recent dive. The device keeps an internal counter
        // incremented on every dive and stores the value in the header, so
        // the most recent dive carries the highest number.
        let mut count = 0;
        let mut latest = 0;
        let mut maximum = 0;
        for i in 0..RB_LOGBOOK_COUNT {
            let offset = i * RB_LOGBOOK_SIZE;
            let entry = &header[offset..offset + RB_LOGBOOK_SIZE];

            if bytes::is_equal(entry, 0xFF) {
                continue;
            }

            let current = bytes::u16_le(&entry[52..]);
            if current > maximum {
                maximum = current;
                latest = i;
            }

            count += 1;
        }

        // Aggregate the total and maximum size, stopping at the fingerprint.
        let mut ndives = 0;
        let mut size = 0u32;
        let mut maxsize = 0u32;
        for i in 0..count {
            let idx = (latest + RB_LOGBOOK_COUNT - i) % RB_LOGBOOK_COUNT;
            let offset = idx * RB_LOGBOOK_SIZE;
            let entry = &header[offset..offset + RB_LOGBOOK_SIZE];

            if bytes::is_equal(entry, 0xFF) {
                warn!("Unexpected empty header found.");
                break;
            }

            let length = profile_length(entry)?;

            if entry[9..9 + SZ_FINGERPRINT] == self.fingerprint {
                break;
            }

            if length > maxsize {
                maxsize = length;
            }
            size += length;
            ndives += 1;
        }

        // Refine the progress maximum now that the dive sizes are known.
        progress.set_maximum((RB_LOGBOOK_SIZE * RB_LOGBOOK_COUNT) as u32 + size);

        if ndives == 0 {
            return Ok(());
        }

        let mut profile = vec![0u8; maxsize as usize];
        for i in 0..ndives {
            let idx = (latest + RB_LOGBOOK_COUNT - i) % RB_LOGBOOK_COUNT;
            let offset = idx * RB_LOGBOOK_SIZE;
            let entry = &header[offset..offset + RB_LOGBOOK_SIZE];

            let length = profile_length(entry)? as usize;

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

            // The profile repeats the logbook header; both copies must agree.
            if profile[..RB_LOGBOOK_SIZE] != *entry {
                error!("Unexpected profile header.");
                return Err(Error::Protocol("profile header mismatch".into()));
            }

            let keep_going = callback(Dive {
                data: &profile[..length],
                fingerprint: &profile[9..9 + SZ_FINGERPRINT],
            });
            if !keep_going {
                break;
            }
        }

        Ok(())
    }
}

/// Profile length for one logbook entry: the repeated header plus the ring
/// distance between the 24-bit profile pointers, minus the 6 pointer bytes.
fn profile_length(entry: &[u8]) -> Result<u32> {
    let begin = bytes::u24_le(&entry[2..]);
    let end = bytes::u24_le(&entry[5..]);
    if begin < RB_PROFILE_BEGIN
        || begin >= RB_PROFILE_END
        || end < RB_PROFILE_BEGIN
        || end >= RB_PROFILE_END
    {
        error!("Invalid ringbuffer pointer detected.");
        return Err(Error::DataFormat("profile pointer out of range".into()));
    }

    Ok(RB_LOGBOOK_SIZE as u32 + rb_profile_distance(begin, end) - 6)
}

fn pad_text<const N: usize>(text: &str) -> Result<[u8; N]> {
    let text = text.as_bytes();
    if text.len() > N {
        error!("Invalid parameter specified.");
        return Err(Error::InvalidArgs(format!(
            "text longer than {N} bytes"
        )));
    }
    let mut packet = [0x20u8; N];
    packet[..text.len()].copy_from_slice(text);
    Ok(packet)
}

impl<P: Port> Device for FrogDevice<P> {
    fn family(&self) -> Family {
        Family::HwFrog
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

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.foreach_inner(callback)
    }

    fn close(&mut self) -> Result<()> {
        debug!("Closing Frog session");
        self.transfer(None, EXIT, None, &mut [])?;
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
impl FrogDevice<crate::port::NativePort> {
    /// Open a Frog on a native serial port.
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

    fn empty_entry() -> [u8; RB_LOGBOOK_SIZE] {
        [0xFF; RB_LOGBOOK_SIZE]
    }

    fn entry(number: u16, begin: u32, end: u32, marker: u8) -> [u8; RB_LOGBOOK_SIZE] {
        let mut e = [0u8; RB_LOGBOOK_SIZE];
        e[0] = marker;
        e[2..5].copy_from_slice(&begin.to_le_bytes()[..3]);
        e[5..8].copy_from_slice(&end.to_le_bytes()[..3]);
        e[9..14].copy_from_slice(&[marker, 0xA0, 0xA1, 0xA2, 0xA3]);
        e[52..54].copy_from_slice(&number.to_le_bytes());
        e
    }

    fn scripted_device(headers: Vec<u8>) -> MockPort {
        let mut port = MockPort::new();
        port.respond_with(move |cmd| match cmd {
            [INIT] => vec![READY],
            [IDENTITY] => {
                let mut reply = vec![IDENTITY];
                reply.extend_from_slice(&[0x34, 0x12, 0x00, 0x5A]); // serial, firmware
                reply.extend_from_slice(&[0u8; SZ_VERSION - 4]);
                reply.push(READY);
                reply
            },
            [HEADER] => {
                let mut reply = headers.clone();
                reply.push(READY);
                reply
            },
            [DIVE] => vec![DIVE],
            [idx] => {
                // Dive number: reply with the matching profile.
                let offset = usize::from(*idx) * RB_LOGBOOK_SIZE;
                let entry = &headers[offset..offset + RB_LOGBOOK_SIZE];
                let length = profile_length(entry).unwrap() as usize;
                let mut reply = entry.to_vec();
                reply.resize(length, 0xCC);
                reply.push(READY);
                reply
            },
            _ => vec![],
        });
        port
    }

    fn header_region() -> Vec<u8> {
        // Slots 0 and 1 empty, slot 2 internal number 5, slot 3 internal
        // number 7 (the highest, hence the newest).
        let mut headers = Vec::new();
        headers.extend_from_slice(&empty_entry());
        headers.extend_from_slice(&empty_entry());
        headers.extend_from_slice(&entry(0x0005, 0x000100, 0x000110, 2));
        headers.extend_from_slice(&entry(0x0007, 0x000200, 0x000220, 3));
        for _ in 4..RB_LOGBOOK_COUNT {
            headers.extend_from_slice(&empty_entry());
        }
        headers
    }

    #[test]
    fn test_header_scan_orders_dives_newest_first() {
        let context = Arc::new(Context::new());
        let port = scripted_device(header_region());
        let mut device = FrogDevice::new(context, port).unwrap();

        let mut seen = Vec::new();
        device
            .foreach(&mut |dive: Dive<'_>| {
                seen.push((dive.data[0], dive.data.len()));
                true
            })
            .unwrap();

        // Backward order [3, 2]; lengths follow the ring pointers.
        assert_eq!(
            seen,
            vec![(3, 256 + 0x20 - 6), (2, 256 + 0x10 - 6)]
        );
        let devinfo = device.devinfo().unwrap();
        assert_eq!(devinfo.serial, 0x1234);
        assert_eq!(devinfo.firmware, 0x005A);
    }

    #[test]
    fn test_fingerprint_halts_enumeration() {
        let context = Arc::new(Context::new());
        let port = scripted_device(header_region());
        let mut device = FrogDevice::new(context, port).unwrap();

        // Fingerprint of the newest dive (slot 3): no callbacks at all.
        device
            .set_fingerprint(&[3, 0xA0, 0xA1, 0xA2, 0xA3])
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

    #[test]
    fn test_fingerprint_length_is_checked() {
        let context = Arc::new(Context::new());
        let port = scripted_device(header_region());
        let mut device = FrogDevice::new(context, port).unwrap();

        assert!(matches!(
            device.set_fingerprint(&[0; 4]),
            Err(Error::InvalidArgs(_))
        ));
        device.set_fingerprint(&[]).unwrap();
    }

    #[test]
    fn test_cancel_stops_before_next_dive() {
        let context = Arc::new(Context::new());
        let port = scripted_device(header_region());
        let mut device = FrogDevice::new(context, port).unwrap();

        let token = device.cancel_token();
        let mut calls = 0;
        let result = device.foreach(&mut |_dive| {
            calls += 1;
            token.cancel();
            true
        });

        // One dive was delivered before the cancellation; the next protocol
        // turn reports Cancelled and no further dive reaches the callback.
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_bad_ring_pointer_is_dataformat() {
        let mut headers = Vec::new();
        let mut bad = entry(0x0001, 0x000100, 0x000110, 0);
        bad[5..8].copy_from_slice(&0x300000u32.to_le_bytes()[..3]); // past RB_PROFILE_END
        headers.extend_from_slice(&bad);
        for _ in 1..RB_LOGBOOK_COUNT {
            headers.extend_from_slice(&empty_entry());
        }

        let context = Arc::new(Context::new());
        let port = scripted_device(headers);
        let mut device = FrogDevice::new(context, port).unwrap();

        let result = device.foreach(&mut |_dive| true);
        assert!(matches!(result, Err(Error::DataFormat(_))));
    }

    #[test]
    fn test_progress_is_monotone() {
        let context = Arc::new(Context::new());
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&seen);
        context.set_event_handler(move |event| {
            if let Event::Progress { current, .. } = event {
                sink.lock().unwrap().push(*current);
            }
        });

        let port = scripted_device(header_region());
        let mut device = FrogDevice::new(Arc::clone(&context), port).unwrap();
        device.foreach(&mut |_dive| true).unwrap();

        let values = seen.lock().unwrap();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert!(!values.is_empty());
    }
}
