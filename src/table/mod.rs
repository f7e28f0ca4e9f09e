//! Tabular file layer (CSV / JSON Lines).

mod tabular;

pub use tabular::*;
