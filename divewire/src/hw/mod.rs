//! Heinrichs Weikamp devices (Frog, OSTC3).

pub mod firmware;
pub mod frog;
pub mod ostc3;

pub use firmware::FirmwareImage;
pub use frog::FrogDevice;
pub use ostc3::Ostc3Device;
