pub mod builtin;
pub mod dispatcher;
pub mod registry;


pub use builtin::*;
pub use dispatcher::*;
pub use registry::*;
