//! Encodes information about the registers and bit-fields of a device memory map. This
//! information is used to turn symbolic names into bus locations.

mod field;
mod map;
mod register;

// Anything that's part of the public API of the submodules is also part of the public API of
// model
pub use field::*;
pub use map::*;
pub use register::*;

use std::fmt;

use crate::bits::BitSpan;

/// Bus address of a chip
pub type DeviceId = u8;

/// Byte address within a table
pub type Address = u32;

/// Fully resolved bus location of a register or bit-field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldLocation {
    pub device_id: DeviceId,
    pub table: Table,
    /// Byte address of the first (most significant) byte
    pub offset: Address,
    pub span: BitSpan,
}

impl fmt::Display for FieldLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ device: {:#04x}, table: {}, offset: {:#x}, lsbit: {}, length: {} }}",
            self.device_id,
            self.table,
            self.offset,
            self.span.lsbit(),
            self.span.length()
        )
    }
}
