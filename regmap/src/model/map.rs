//! `RegisterMap` is the read-only name lookup at the heart of the accessor.

use std::{collections::HashMap, path};

use fs_err as fs;

use crate::{
    bits::{BitSpan, MAX_FIELD_BITS},
    error::LoadError,
    frontend,
    model::{BitFieldRecord, DeviceId, FieldLocation, RegisterRecord},
};

/// Name of the table-select register unless the register map says otherwise
pub const DEFAULT_TABLE_SELECT: &str = "TABLE_SEL";

/// Register map database
///
/// Holds every register and bit-field of a device in source order, along with the auxiliary
/// lookups that ship in the same database: named chip sequences and digital debug signals.
#[derive(Clone, Debug)]
pub struct RegisterMap {
    registers: Vec<RegisterRecord>,
    register_idx: HashMap<String, usize>,
    bit_fields: Vec<BitFieldRecord>,
    bit_field_idx: HashMap<String, usize>,
    address_width_bytes: u8,
    table_select: String,
    chip_sequences: HashMap<String, Vec<(String, u64)>>,
    test_signals: HashMap<String, u64>,
}

/// Outcome of looking up a symbolic name
///
/// Bit-fields take precedence over registers of the same name.
#[derive(Clone, Copy, Debug)]
pub enum Resolution<'m> {
    BitField {
        field: &'m BitFieldRecord,
        register: &'m RegisterRecord,
    },
    Register(&'m RegisterRecord),
    Unresolved,
}

impl<'m> Resolution<'m> {
    /// Bus location of the resolved item
    ///
    /// A plain register is addressed as a single whole byte. `device_override` replaces the
    /// device id recorded in the map.
    pub fn location(&self, device_override: Option<DeviceId>) -> Option<FieldLocation> {
        let (register, span) = match self {
            Self::BitField { field, register } => (*register, field.span()),
            Self::Register(register) => (*register, BitSpan::whole_byte()),
            Self::Unresolved => return None,
        };
        Some(FieldLocation {
            device_id: device_override.unwrap_or(register.device_id),
            table: register.table,
            offset: register.offset,
            span,
        })
    }
}

impl RegisterMap {
    /// Build a register map from records, validating every bit-field
    ///
    /// # Errors
    ///
    /// - A name is defined twice within its namespace
    /// - A bit-field is wider than 64 bits, empty, starts beyond bit 63, or refers to an
    ///   unknown register
    pub fn from_records(
        registers: Vec<RegisterRecord>,
        bit_fields: Vec<BitFieldRecord>,
    ) -> Result<Self, LoadError> {
        let register_idx = index_by_name(&registers, |r| &r.name)?;
        let bit_field_idx = index_by_name(&bit_fields, |f| &f.name)?;

        for field in &bit_fields {
            if field.length == 0 || field.length > MAX_FIELD_BITS {
                return Err(LoadError::InvalidAttribute {
                    record: field.name.clone(),
                    attr: "length",
                    value: field.length.to_string(),
                });
            }
            if field.justification >= MAX_FIELD_BITS {
                return Err(LoadError::InvalidAttribute {
                    record: field.name.clone(),
                    attr: "justification",
                    value: field.justification.to_string(),
                });
            }
            if !register_idx.contains_key(&field.register) {
                return Err(LoadError::DanglingRegister {
                    field: field.name.clone(),
                    register: field.register.clone(),
                });
            }
        }

        Ok(Self {
            registers,
            register_idx,
            bit_fields,
            bit_field_idx,
            address_width_bytes: 1,
            table_select: DEFAULT_TABLE_SELECT.to_owned(),
            chip_sequences: HashMap::new(),
            test_signals: HashMap::new(),
        })
    }

    /// Parse a register map from the text of a JSON database
    ///
    /// # Errors
    ///
    /// Invalid JSON or an inconsistent register map, see [`Self::from_records`]
    pub fn from_json_str(text: &str) -> Result<Self, LoadError> {
        frontend::json::parse_register_map(text)
    }

    /// Read and parse a JSON database
    ///
    /// # Errors
    ///
    /// The file cannot be read, or see [`Self::from_json_str`]
    pub fn from_path(path: &path::Path) -> Result<Self, LoadError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    #[must_use]
    pub const fn with_address_width(mut self, bytes: u8) -> Self {
        self.address_width_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_table_select(mut self, register: impl Into<String>) -> Self {
        self.table_select = register.into();
        self
    }

    #[must_use]
    pub fn with_chip_sequence(mut self, name: impl Into<String>, steps: Vec<(String, u64)>) -> Self {
        self.chip_sequences.insert(name.into(), steps);
        self
    }

    #[must_use]
    pub fn with_test_signal(mut self, signal: impl Into<String>, address: u64) -> Self {
        self.test_signals.insert(signal.into(), address);
        self
    }

    /// Look up `name`, trying bit-fields first and registers second
    pub fn lookup(&self, name: &str) -> Resolution<'_> {
        if let Some(field) = self.bit_field(name) {
            // Owning register existence is checked on construction
            if let Some(register) = self.register(&field.register) {
                return Resolution::BitField { field, register };
            }
        }
        match self.register(name) {
            Some(register) => Resolution::Register(register),
            None => Resolution::Unresolved,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bit_field_idx.contains_key(name) || self.register_idx.contains_key(name)
    }

    pub fn register(&self, name: &str) -> Option<&RegisterRecord> {
        self.register_idx.get(name).map(|&idx| &self.registers[idx])
    }

    pub fn bit_field(&self, name: &str) -> Option<&BitFieldRecord> {
        self.bit_field_idx.get(name).map(|&idx| &self.bit_fields[idx])
    }

    /// All registers in source order
    pub fn registers(&self) -> &[RegisterRecord] {
        &self.registers
    }

    /// All bit-fields in source order
    pub fn bit_fields(&self) -> &[BitFieldRecord] {
        &self.bit_fields
    }

    /// Number of bytes used to address device memory
    pub const fn address_width_bytes(&self) -> u8 {
        self.address_width_bytes
    }

    /// Name of the register that selects the active table
    pub fn table_select(&self) -> &str {
        &self.table_select
    }

    pub fn chip_sequence(&self, name: &str) -> Option<&[(String, u64)]> {
        self.chip_sequences.get(name).map(Vec::as_slice)
    }

    /// Value to write to the debug multiplexer to route `signal` out
    pub fn test_signal(&self, signal: &str) -> Option<u64> {
        self.test_signals.get(signal).copied()
    }

    pub const fn test_signals(&self) -> &HashMap<String, u64> {
        &self.test_signals
    }
}

fn index_by_name<T>(
    items: &[T],
    name_of: impl Fn(&T) -> &String,
) -> Result<HashMap<String, usize>, LoadError> {
    let mut idx = HashMap::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let name = name_of(item);
        if idx.insert(name.clone(), i).is_some() {
            return Err(LoadError::Duplicate { name: name.clone() });
        }
    }
    Ok(idx)
}

#[cfg(test)]
pub(crate) fn status_map() -> RegisterMap {
    use crate::model::{Table, WriteAccess};

    RegisterMap::from_records(
        vec![
            RegisterRecord::new("TABLE_SEL", 0x50, Table::Unselectable, 0x7f),
            RegisterRecord::new("STATUS", 0x50, Table::Index(0), 0x10),
            RegisterRecord::new("CTRL", 0x50, Table::Index(1), 0x20),
            RegisterRecord::new("GAIN", 0x50, Table::Index(1), 0x21),
        ],
        vec![
            BitFieldRecord::new("busy", "STATUS", 3, 1)
                .with_write_access(WriteAccess::All)
                .with_reset_value(0),
            BitFieldRecord::new("mode", "STATUS", 4, 2)
                .with_write_access(WriteAccess::Pw0)
                .with_reset_value(1),
            BitFieldRecord::new("threshold", "CTRL", 4, 12)
                .with_write_access(WriteAccess::Cond)
                .with_reset_value(0x80),
            BitFieldRecord::new("tb_override", "GAIN", 0, 1)
                .with_write_access(WriteAccess::All),
        ],
    )
    .unwrap()
}

#[test]
fn lookup_prefers_bit_fields() {
    let map = status_map();
    assert!(matches!(
        map.lookup("busy"),
        Resolution::BitField { field, register } if field.name == "busy" && register.name == "STATUS"
    ));
    assert!(matches!(map.lookup("STATUS"), Resolution::Register(r) if r.offset == 0x10));
    assert!(matches!(map.lookup("NOT_A_REAL_NAME"), Resolution::Unresolved));
}

#[test]
fn location_applies_device_override() {
    let map = status_map();
    let loc = map.lookup("threshold").location(None).unwrap();
    assert_eq!(loc.device_id, 0x50);
    assert_eq!(loc.offset, 0x20);
    assert_eq!(loc.span, BitSpan::new(4, 12));

    let loc = map.lookup("GAIN").location(Some(0x51)).unwrap();
    assert_eq!(loc.device_id, 0x51);
    assert_eq!(loc.span, BitSpan::whole_byte());

    assert!(map.lookup("nope").location(None).is_none());
}

#[test]
fn invalid_bit_fields_are_rejected() {
    use crate::model::Table;

    let regs = || vec![RegisterRecord::new("R", 0x10, Table::Index(0), 0)];
    let err = RegisterMap::from_records(regs(), vec![BitFieldRecord::new("f", "R", 0, 0)]);
    assert!(matches!(err, Err(LoadError::InvalidAttribute { attr: "length", .. })));
    let err = RegisterMap::from_records(regs(), vec![BitFieldRecord::new("f", "R", 64, 1)]);
    assert!(matches!(err, Err(LoadError::InvalidAttribute { attr: "justification", .. })));
    let err = RegisterMap::from_records(regs(), vec![BitFieldRecord::new("f", "Q", 0, 1)]);
    assert!(matches!(err, Err(LoadError::DanglingRegister { .. })));
    let err = RegisterMap::from_records(
        vec![
            RegisterRecord::new("R", 0x10, Table::Index(0), 0),
            RegisterRecord::new("R", 0x10, Table::Index(0), 1),
        ],
        vec![],
    );
    assert!(matches!(err, Err(LoadError::Duplicate { name }) if name == "R"));
}
