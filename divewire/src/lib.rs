//! # divewire
//!
//! A library for downloading and decoding dive logs from consumer dive
//! computers over a serial transport.
//!
//! The crate is split along the two halves of the job:
//!
//! - **Devices** ([`Device`]): framed request/response protocols that pull
//!   raw dive blobs out of the computer's memory, with ring-buffer
//!   reassembly, fingerprint-based incremental download, progress events
//!   and cancellation.
//! - **Parsers** ([`Parser`]): stateful decoders that turn each vendor's
//!   binary blob into a canonical record (dive-level fields plus a
//!   time-ordered sample stream).
//!
//! Both sides are trait objects over per-family backends; the
//! [`parser_for_device`] dispatcher connects them.
//!
//! ## Supported families
//!
//! Devices: Heinrichs Weikamp Frog and OSTC3 (including firmware updates),
//! Suunto D9 generation, Uwatec Aladin, Mares Puck, Zeagle N2iTiON3.
//! Parsers: Suunto D9, Oceanic Atom 2, Atomic Aquatics Cobalt, Shearwater
//! Predator/Petrel.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use divewire::{Context, Device, Event, FrogDevice, parser_for_device};
//!
//! fn main() -> divewire::Result<()> {
//!     let context = Arc::new(Context::new());
//!     context.set_event_handler(|event| {
//!         if let Event::Progress { current, maximum } = event {
//!             println!("{current}/{maximum}");
//!         }
//!     });
//!
//!     let mut device = FrogDevice::open(Arc::clone(&context), "/dev/ttyUSB0")?;
//!     let mut dives = Vec::new();
//!     device.foreach(&mut |dive| {
//!         dives.push(dive.data.to_vec());
//!         true
//!     })?;
//!
//!     let mut parser = parser_for_device(&device)?;
//!     for dive in &dives {
//!         parser.set_data(dive);
//!         let datetime = parser.datetime()?;
//!         println!("dive at {}-{:02}-{:02}", datetime.year, datetime.month, datetime.day);
//!     }
//!
//!     device.close()
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bytes;
pub mod checksum;
pub mod context;
pub mod datetime;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod family;
pub mod parser;
pub mod port;
pub mod ringbuffer;
pub mod units;

pub mod atomics;
pub mod hw;
pub mod mares;
pub mod oceanic;
pub mod shearwater;
pub mod suunto;
pub mod uwatec;
pub mod zeagle;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    atomics::CobaltParser,
    context::{ClockSync, Context, DevInfo, Event},
    datetime::DateTime,
    device::{CancelToken, Device, Dive, DiveCallback},
    dispatch::parser_for_device,
    error::{Error, Result},
    family::Family,
    hw::{FirmwareImage, FrogDevice, Ostc3Device},
    mares::PuckDevice,
    oceanic::Atom2Parser,
    parser::{
        DecoKind, DiveMode, EventFlags, Field, FieldString, FieldValue, GasMix, Parser, Sample,
        SampleCallback, SampleEvent, Salinity, Tank, TankVolume, VendorKind, WaterKind,
    },
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    shearwater::PredatorParser,
    suunto::{D9Device, D9Parser},
    uwatec::AladinDevice,
    zeagle::N2ition3Device,
};
