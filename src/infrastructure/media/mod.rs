//! Media engine implementations

pub mod memory;

pub use memory::{MemoryMediaEngine, MemoryStream};
