pub mod memory;
pub mod types;


pub use memory::{EstablishOutcome, MemoryTransport, PairingMode, SentMessage};
pub use types::*;
