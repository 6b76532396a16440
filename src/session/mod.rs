pub mod backoff;
pub mod manager;
pub mod recovery;
pub mod state;
pub mod status;
pub mod timer;

#[cfg(test)]
mod tests;

pub use backoff::*;
pub use manager::*;
pub use recovery::*;
pub use state::*;
pub use status::*;
pub use timer::*;
