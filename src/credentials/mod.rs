pub mod backup;
pub mod material;
pub mod store;


pub use backup::*;
pub use material::*;
pub use store::*;
