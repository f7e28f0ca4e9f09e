//! Core data models for surveyor.

mod config;
mod error;
mod record;

pub use config::*;
pub use error::*;
pub use record::*;
