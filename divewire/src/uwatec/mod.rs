//! Uwatec devices (Aladin).

pub mod aladin;

pub use aladin::AladinDevice;
