pub mod batch;
pub mod bucket;

pub use batch::*;
pub use bucket::*;
