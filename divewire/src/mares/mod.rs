//! Mares devices (Nemo/Puck generation).

pub mod puck;

pub use puck::PuckDevice;
