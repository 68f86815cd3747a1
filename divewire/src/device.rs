//! Device abstraction: the download side of a dive computer session.
//!
//! Each family implements [`Device`] for its session type. Slots a family
//! does not support keep the default implementation, which reports
//! [`Error::Unsupported`]. Long-running operations report progress and
//! identity through the session's [`Context`] and poll the device's
//! [`CancelToken`] at every protocol turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::{ClockSync, Context, DevInfo, Event};
use crate::error::{Error, Result};
use crate::family::Family;

/// One downloaded dive, borrowed from the device session's buffers.
#[derive(Debug, Clone, Copy)]
pub struct Dive<'a> {
    /// The raw dive blob, newest-first within an enumeration.
    pub data: &'a [u8],
    /// The vendor-specific fingerprint identifying this dive.
    pub fingerprint: &'a [u8],
}

/// Per-dive callback. Return `false` to stop the enumeration early; the
/// download still counts as successful.
pub type DiveCallback<'a> = dyn FnMut(Dive<'_>) -> bool + 'a;

/// Cloneable cancellation flag, checked at every protocol turn.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The running operation returns
    /// [`Error::Cancelled`] at its next protocol turn; no partial dive is
    /// ever delivered.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// An open communication session with one physical dive computer.
pub trait Device {
    /// The family this device belongs to.
    fn family(&self) -> Family;

    /// Set the fingerprint of the most recent dive already known to the
    /// caller. An empty slice clears it; any other length must match the
    /// family's fingerprint size or the call fails with `InvalidArgs`.
    fn set_fingerprint(&mut self, data: &[u8]) -> Result<()>;

    /// Read a window of device memory.
    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        let _ = (address, data);
        Err(Error::Unsupported("memory read".into()))
    }

    /// Write a window of device memory.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let _ = (address, data);
        Err(Error::Unsupported("memory write".into()))
    }

    /// Append the entire memory image to `buffer`.
    fn dump(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let _ = buffer;
        Err(Error::Unsupported("memory dump".into()))
    }

    /// Enumerate dives newest-first, stopping at the configured
    /// fingerprint.
    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let _ = callback;
        Err(Error::Unsupported("dive enumeration".into()))
    }

    /// Close the session, sending the family's exit sequence where one
    /// exists, and release the transport.
    fn close(&mut self) -> Result<()>;

    /// The session's cancellation token.
    fn cancel_token(&self) -> CancelToken;

    /// Device identity, once known (after the first `foreach`/`dump` for
    /// most families).
    fn devinfo(&self) -> Option<DevInfo> {
        None
    }

    /// Device clock snapshot, for families that expose one.
    fn clock(&self) -> Option<ClockSync> {
        None
    }
}

/// Progress accounting that re-emits through the context on every change.
pub(crate) struct Progress<'a> {
    context: &'a Context,
    current: u32,
    maximum: u32,
}

impl<'a> Progress<'a> {
    /// Start a progress report with a provisional maximum.
    pub fn new(context: &'a Context, maximum: u32) -> Self {
        let progress = Self {
            context,
            current: 0,
            maximum,
        };
        progress.emit();
        progress
    }

    pub fn advance(&mut self, delta: u32) {
        self.current += delta;
        self.emit();
    }

    /// Refine the expected total once the real dive sizes are known.
    pub fn set_maximum(&mut self, maximum: u32) {
        self.maximum = maximum;
        self.emit();
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    fn emit(&self) {
        self.context.emit(&Event::Progress {
            current: self.current,
            maximum: self.maximum,
        });
    }
}

/// Read a full memory image in fixed-size pages through `read`, reporting
/// progress per page. Shared by the families whose dump is a plain loop
/// over their read primitive.
pub(crate) fn dump_paged<F>(
    buffer: &mut Vec<u8>,
    memsize: usize,
    pagesize: usize,
    progress: &mut Progress<'_>,
    mut read: F,
) -> Result<()>
where
    F: FnMut(u32, &mut [u8]) -> Result<()>,
{
    buffer.clear();
    buffer.resize(memsize, 0);

    let mut nbytes = 0;
    while nbytes < memsize {
        let len = pagesize.min(memsize - nbytes);
        read(nbytes as u32, &mut buffer[nbytes..nbytes + len])?;
        progress.advance(len as u32);
        nbytes += len;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_dump_paged_reads_every_page() {
        let context = Context::new();
        let mut progress = Progress::new(&context, 10);
        let mut buffer = Vec::new();
        let mut addresses = Vec::new();

        dump_paged(&mut buffer, 10, 4, &mut progress, |addr, page| {
            addresses.push((addr, page.len()));
            page.fill(addr as u8);
            Ok(())
        })
        .unwrap();

        assert_eq!(addresses, vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(buffer, vec![0, 0, 0, 0, 4, 4, 4, 4, 8, 8]);
        assert_eq!(progress.current(), 10);
    }
}
