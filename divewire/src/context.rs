//! Shared context: event reporting for device sessions.
//!
//! A [`Context`] carries the event sink that device code reports through
//! while a download is running. Severity-levelled logging goes through the
//! `log` facade instead; the embedding application picks the logger.
//!
//! One context may be shared by several devices, but a device and its
//! context must stay on the owning thread while an operation is running.

use std::sync::Mutex;

/// Device identity, reported once per session as soon as it is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DevInfo {
    /// Model number.
    pub model: u32,
    /// Firmware version.
    pub firmware: u32,
    /// Serial number.
    pub serial: u32,
}

/// Snapshot correlating the host clock with the device clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClockSync {
    /// Host time at capture, seconds since the Unix epoch.
    pub systime: i64,
    /// Raw device time at capture, in device-specific ticks.
    pub devtime: u32,
}

/// Events emitted by device code during `foreach`/`dump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// Still polling for the device signature; nothing received yet.
    Waiting,
    /// Download progress. `current` is monotone non-decreasing within a
    /// session; `maximum` is provisional until the dive sizes are known.
    Progress {
        /// Bytes transferred so far.
        current: u32,
        /// Expected total.
        maximum: u32,
    },
    /// Device identity (once per session).
    DevInfo(DevInfo),
    /// Device clock snapshot (once, for families exposing a clock).
    Clock(ClockSync),
    /// Vendor-specific event payload.
    Vendor(&'a [u8]),
}

type EventHandler = Box<dyn FnMut(&Event<'_>) + Send>;

/// Shared state for a set of device sessions.
#[derive(Default)]
pub struct Context {
    handler: Mutex<Option<EventHandler>>,
}

impl Context {
    /// Create a new context with no event handler installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the event handler. Replaces any previous handler.
    pub fn set_event_handler(&self, handler: impl FnMut(&Event<'_>) + Send + 'static) {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Remove the event handler.
    pub fn clear_event_handler(&self) {
        *self.handler.lock().unwrap() = None;
    }

    pub(crate) fn emit(&self, event: &Event<'_>) {
        if let Some(handler) = self.handler.lock().unwrap().as_mut() {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_emit_without_handler() {
        let context = Context::new();
        context.emit(&Event::Waiting);
    }

    #[test]
    fn test_emit_reaches_handler() {
        let context = Context::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        context.set_event_handler(move |event| {
            if let Event::Progress { current, .. } = event {
                counter.store(*current, Ordering::Relaxed);
            }
        });

        context.emit(&Event::Progress {
            current: 42,
            maximum: 100,
        });
        assert_eq!(seen.load(Ordering::Relaxed), 42);

        context.clear_event_handler();
        context.emit(&Event::Progress {
            current: 7,
            maximum: 100,
        });
        assert_eq!(seen.load(Ordering::Relaxed), 42);
    }
}
