//! `RegisterRecord` describes one byte-addressable register of the memory map.

use std::fmt;

use crate::model::{Address, DeviceId};

/// A named register as described by the register map
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterRecord {
    pub name: String,
    /// Bus address of the chip, unless overridden by the accessor configuration
    pub device_id: DeviceId,
    /// Bank that has to be selected before the register can be addressed
    pub table: Table,
    /// Byte address of the first byte of the register within its table
    pub offset: Address,
    pub reset_value: Option<u64>,
}

impl RegisterRecord {
    pub fn new(name: impl Into<String>, device_id: DeviceId, table: Table, offset: Address) -> Self {
        Self {
            name: name.into(),
            device_id,
            table,
            offset,
            reset_value: None,
        }
    }

    #[must_use]
    pub const fn with_reset_value(mut self, reset_value: u64) -> Self {
        self.reset_value = Some(reset_value);
        self
    }
}

/// Table (bank) reference of a register
///
/// Register map sources occasionally assign tables that cannot be written into the table-select
/// register, such as negative numbers or symbolic names. These are kept as
/// [`Table::Unselectable`] and resolved through [`coerce_to_table_zero`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Index(u8),
    Unselectable,
}

impl Default for Table {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl From<u8> for Table {
    fn from(value: u8) -> Self {
        Self::Index(value)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(idx) => write!(f, "{idx}"),
            Self::Unselectable => write!(f, "unselectable"),
        }
    }
}

/// Index written to the table-select register for `table`
///
/// Unselectable tables fall back to table 0. Legacy register maps rely on this for registers
/// that live outside any bank.
pub const fn coerce_to_table_zero(table: Table) -> u8 {
    match table {
        Table::Index(idx) => idx,
        Table::Unselectable => 0,
    }
}

#[test]
fn unselectable_tables_become_zero() {
    assert_eq!(coerce_to_table_zero(Table::Unselectable), 0);
    assert_eq!(coerce_to_table_zero(Table::Index(0)), 0);
    assert_eq!(coerce_to_table_zero(Table::Index(3)), 3);
}
