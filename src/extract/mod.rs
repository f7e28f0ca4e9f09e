//! Structured-field extraction from model output.

mod response;

pub use response::*;
