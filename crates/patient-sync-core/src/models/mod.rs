//! Domain models for the patient sync engine.

mod delta;
mod patient;
mod raw;
mod source;
mod status;

pub use delta::*;
pub use patient::*;
pub use raw::*;
pub use source::*;
pub use status::*;
