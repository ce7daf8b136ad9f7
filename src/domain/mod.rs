//! Core domain types and traits

pub mod ports;

pub use ports::*;
