//! Zeagle devices (N2iTiON3).

pub mod n2ition3;

pub use n2ition3::N2ition3Device;
