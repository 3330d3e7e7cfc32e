//! Value types shared by every stage of the pipeline.

pub mod event;
pub mod object;
pub mod release;

pub use event::*;
pub use object::*;
pub use release::*;
