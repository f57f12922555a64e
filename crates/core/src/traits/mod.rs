pub mod sink;
pub mod store;

pub use sink::*;
pub use store::*;
