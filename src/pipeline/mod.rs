//! Pipeline module - survey annotation and network matrix export.

mod annotate;
mod network;

pub use annotate::*;
pub use network::*;
