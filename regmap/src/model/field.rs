use std::str;

use strum::{Display, EnumString};

use crate::bits::BitSpan;

/// A named sub-register bit-field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitFieldRecord {
    pub name: String,
    /// Name of the owning [`crate::RegisterRecord`]
    pub register: String,
    /// Index of the field's least significant bit, counted from bit 0 of the register's last
    /// byte
    pub justification: u32,
    /// Width of the field in bits
    pub length: u32,
    pub write_access: Option<WriteAccess>,
    /// Value of the field after power-on reset
    pub reset_value: Option<u64>,
}

impl BitFieldRecord {
    pub fn new(
        name: impl Into<String>,
        register: impl Into<String>,
        justification: u32,
        length: u32,
    ) -> Self {
        Self {
            name: name.into(),
            register: register.into(),
            justification,
            length,
            write_access: None,
            reset_value: None,
        }
    }

    #[must_use]
    pub fn with_write_access(mut self, write_access: WriteAccess) -> Self {
        self.write_access = Some(write_access);
        self
    }

    #[must_use]
    pub const fn with_reset_value(mut self, reset_value: u64) -> Self {
        self.reset_value = Some(reset_value);
        self
    }

    /// # Panics
    ///
    /// The record has not been validated by [`crate::RegisterMap`]
    pub fn span(&self) -> BitSpan {
        BitSpan::new(self.justification, self.length)
    }

    /// Whether the field may be written by bulk operations such as settings restores
    pub fn is_user_writable(&self) -> bool {
        self.write_access
            .as_ref()
            .map_or(false, WriteAccess::is_user_writable)
    }
}

/// Write privilege classification of a bit-field
///
/// Parsed case-insensitively. Classifications outside the known levels, e.g., `n/a`, are kept
/// verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum WriteAccess {
    /// Conditionally writable
    Cond,
    /// Writable at any privilege level
    All,
    Pw0,
    Pw1,
    Pw2,
    Pw3,
    #[strum(default)]
    Other(String),
}

impl WriteAccess {
    #[must_use]
    pub const fn is_user_writable(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

#[test]
fn write_access_parses_case_insensitively() {
    assert_eq!("ALL".parse::<WriteAccess>().unwrap(), WriteAccess::All);
    assert_eq!("Pw3".parse::<WriteAccess>().unwrap(), WriteAccess::Pw3);
    assert_eq!("cond".parse::<WriteAccess>().unwrap(), WriteAccess::Cond);
    assert_eq!(
        "n/a".parse::<WriteAccess>().unwrap(),
        WriteAccess::Other("n/a".to_owned())
    );
}

#[test]
fn only_known_levels_are_user_writable() {
    let field = BitFieldRecord::new("busy", "STATUS", 3, 1);
    assert!(!field.is_user_writable());
    assert!(field
        .clone()
        .with_write_access(WriteAccess::Pw1)
        .is_user_writable());
    assert!(!field
        .with_write_access(WriteAccess::Other("ro".to_owned()))
        .is_user_writable());
}
