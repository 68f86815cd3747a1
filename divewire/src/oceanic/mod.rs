//! Oceanic parsers (Atom 2 and relatives).

pub mod atom2_parser;

pub use atom2_parser::Atom2Parser;
