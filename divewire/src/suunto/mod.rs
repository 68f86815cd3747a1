//! Suunto devices (D9/D6/D4 serial protocol family).

pub mod d9;
pub mod d9_parser;

pub use d9::D9Device;
pub use d9_parser::D9Parser;
