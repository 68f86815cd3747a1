//! Shearwater parsers (Predator, Petrel).

pub mod predator_parser;

pub use predator_parser::PredatorParser;
