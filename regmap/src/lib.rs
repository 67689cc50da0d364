//! Regmap --- Named, bit-precise access to the registers of a device over a byte-oriented bus,
//! driven by a register map loaded from a JSON database.

// Export full API at crate root
pub use api::*;

mod accessor;
mod api;
mod bits;
mod error;
mod filtering;
mod frontend;
mod model;
mod settings;
mod transport;
mod util;
