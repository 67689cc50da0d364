//! Named, bit-precise access to device registers over a [`ByteTransport`]

use std::{collections::BTreeMap, io, path};

use log::{debug, info, trace};

use crate::{
    bits::byte_fully_owned,
    error::{Error, LoadError, RangeError, SettingsError, TransportError, TransportOp},
    filtering::FieldFilter,
    model::{coerce_to_table_zero, Address, DeviceId, FieldLocation, RegisterMap, Table},
    settings::Settings,
    transport::ByteTransport,
};

/// Chip sequence that soft-resets the device
const SOFT_RESET: &str = "SOFT_RESET";
/// Chip sequence that unlocks password level 3
const PASSWORD_LEVEL_3: &str = "PASSWORD_LEVEL_3";

/// Accessor configuration
///
/// ```
/// # use regmap::{AccessorConfig, Settings};
/// let config = AccessorConfig::default()
///     .device_id(0x50)
///     .dummy(Settings::new());
/// ```
#[derive(Clone, Debug, Default)]
pub struct AccessorConfig {
    /// Bus address used for every access instead of the one recorded per register
    device_id: Option<DeviceId>,
    /// Replace all transport I/O with an in-memory shadow store seeded with these values
    dummy: Option<Settings>,
}

impl AccessorConfig {
    #[must_use]
    pub fn device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Run without a device. Reads return 0, writes are recorded in the shadow store.
    #[must_use]
    pub fn dummy(mut self, defaults: Settings) -> Self {
        self.dummy = Some(defaults);
        self
    }
}

/// Value written to a register or bit-field
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    /// Shifted into place and merged with neighboring bits
    Scalar(u64),
    /// Written as-is starting at the register offset, bypassing masking
    Raw(Vec<u8>),
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Raw(bytes)
    }
}

impl From<&[u8]> for FieldValue {
    fn from(bytes: &[u8]) -> Self {
        Self::Raw(bytes.to_vec())
    }
}

/// Progress report of [`RegisterMapAccessor::non_default_fields`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanEvent<'a> {
    /// A field was read
    Visited {
        name: &'a str,
        value: u64,
        reset_value: u64,
    },
    /// The scan is complete
    Finished { visited: usize, non_default: usize },
}

/// A validated write, ready to be put on the bus
struct PendingWrite {
    name: String,
    location: FieldLocation,
    value: FieldValue,
}

/// Reads and writes registers and bit-fields by name
///
/// Owns the transport, the cached table selection and, in dummy mode, the shadow store. Every
/// bus operation takes `&mut self`; sharing a physical bus between accessors requires external
/// locking around each logical operation.
pub struct RegisterMapAccessor<T: ByteTransport> {
    transport: T,
    map: RegisterMap,
    device_id: Option<DeviceId>,
    dummy: bool,
    shadow: BTreeMap<String, FieldValue>,
    current_table: u8,
}

impl<T: ByteTransport> RegisterMapAccessor<T> {
    /// Configure `transport` for the address width of `map` and start in table 0
    pub fn new(mut transport: T, map: RegisterMap, config: AccessorConfig) -> Self {
        transport.set_address_width(map.address_width_bytes());
        let dummy = config.dummy.is_some();
        let shadow: BTreeMap<_, _> = config
            .dummy
            .map(|defaults| {
                defaults
                    .iter()
                    .map(|(name, value)| (name.to_owned(), FieldValue::Scalar(value)))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            transport,
            map,
            device_id: config.device_id,
            dummy,
            shadow,
            current_table: 0,
        }
    }

    /// # Errors
    ///
    /// The register map at `path` cannot be loaded
    pub fn from_path(
        transport: T,
        path: &path::Path,
        config: AccessorConfig,
    ) -> Result<Self, LoadError> {
        Ok(Self::new(transport, crate::load_map(path)?, config))
    }

    pub const fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Index of the table the device currently addresses, as far as the accessor knows
    pub const fn current_table(&self) -> u8 {
        self.current_table
    }

    pub const fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// Values written in dummy mode, seeded with the configured defaults
    pub const fn shadow(&self) -> &BTreeMap<String, FieldValue> {
        &self.shadow
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// # Errors
    ///
    /// The transport cannot be opened
    pub fn open(&mut self) -> Result<(), Error> {
        if !self.dummy {
            self.transport.open()?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// The transport cannot be closed
    pub fn close(&mut self) -> Result<(), Error> {
        if !self.dummy {
            self.transport.close()?;
        }
        Ok(())
    }

    /// Look up `name` without touching the bus
    fn locate(&self, name: &str) -> Result<FieldLocation, Error> {
        self.map
            .lookup(name)
            .location(self.device_id)
            .ok_or_else(|| Error::NameResolution(name.to_owned()))
    }

    /// Resolve `name` to its bus location and select its table
    ///
    /// # Errors
    ///
    /// - `name` is neither a bit-field nor a register
    /// - Selecting the table fails, see [`Self::select_table`]
    pub fn resolve(&mut self, name: &str) -> Result<FieldLocation, Error> {
        let location = self.locate(name)?;
        self.select_table(location.table)?;
        Ok(location)
    }

    /// Make `table` the addressable table, writing the table-select register only if the
    /// cached selection differs
    ///
    /// [`Table::Unselectable`] selects table 0.
    ///
    /// # Errors
    ///
    /// - The register map has no table-select register
    /// - The transport write fails
    pub fn select_table(&mut self, table: Table) -> Result<(), Error> {
        let idx = coerce_to_table_zero(table);
        if idx == self.current_table {
            return Ok(());
        }
        let (device_id, offset) = self.table_select_location()?;
        if !self.dummy {
            self.transport.write(device_id, offset, &[idx])?;
        }
        debug!("Selected table {idx} (was {})", self.current_table);
        self.current_table = idx;
        Ok(())
    }

    fn table_select_location(&self) -> Result<(DeviceId, Address), Error> {
        let name = self.map.table_select();
        let register = self
            .map
            .register(name)
            .ok_or_else(|| Error::NameResolution(name.to_owned()))?;
        Ok((self.device_id.unwrap_or(register.device_id), register.offset))
    }

    /// Read the right-justified value of a register or bit-field
    ///
    /// Returns 0 in dummy mode, after resolving the name.
    ///
    /// # Errors
    ///
    /// - `name` cannot be resolved
    /// - The transport fails
    pub fn read_field(&mut self, name: &str) -> Result<u64, Error> {
        let location = self.resolve(name)?;
        if self.dummy {
            return Ok(0);
        }
        let span = location.span;
        let bytes = self.read_bytes(location.device_id, location.offset, span.num_bytes())?;
        let value = span.extract(&bytes);
        trace!("{name} @ {location} = {value:#x}");
        Ok(value)
    }

    fn read_bytes(
        &mut self,
        device_id: DeviceId,
        address: Address,
        length: usize,
    ) -> Result<Vec<u8>, Error> {
        let bytes = self.transport.read(device_id, address, length)?;
        if bytes.len() != length {
            return Err(TransportError::new(
                TransportOp::Read,
                device_id,
                address,
                format!("expected {length} byte(s), received {}", bytes.len()),
            )
            .into());
        }
        Ok(bytes)
    }

    /// Write `value` into a register or bit-field, preserving bits of other fields that share
    /// its bytes
    ///
    /// # Errors
    ///
    /// - `name` cannot be resolved
    /// - `value` does not fit the field, checked before any bus traffic
    /// - The transport fails
    pub fn write_field(&mut self, name: &str, value: u64) -> Result<(), Error> {
        self.write_fields([(name, FieldValue::Scalar(value))])
    }

    /// Write `bytes` to consecutive addresses starting at the register offset of `name`
    ///
    /// Intended for whole multi-byte registers; no masking takes place.
    ///
    /// # Errors
    ///
    /// - `name` cannot be resolved
    /// - `bytes` is longer than the field can hold
    /// - The transport fails
    pub fn write_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<(), Error> {
        self.write_fields([(name, FieldValue::from(bytes))])
    }

    /// Write several registers or bit-fields, in the given order
    ///
    /// All entries are resolved and range-checked before the first bus operation, so an invalid
    /// entry anywhere in the batch leaves the device untouched. Once writing has started,
    /// entries are applied one by one and a transport failure leaves the earlier entries
    /// written.
    ///
    /// # Errors
    ///
    /// - An entry cannot be resolved or does not fit its field
    /// - The table-select register is needed but missing from the register map
    /// - The transport fails
    pub fn write_fields<I, K, V>(&mut self, entries: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<FieldValue>,
    {
        let pending = self.validate(entries)?;
        for write in pending {
            self.apply(write)?;
        }
        Ok(())
    }

    fn validate<I, K, V>(&self, entries: I) -> Result<Vec<PendingWrite>, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<FieldValue>,
    {
        let mut table = self.current_table;
        let mut pending = vec![];
        for (name, value) in entries {
            let name = name.as_ref();
            let value = value.into();
            let location = self.locate(name)?;
            check_range(name, &location, &value)?;

            let target = coerce_to_table_zero(location.table);
            if target != table {
                self.table_select_location()?;
                table = target;
            }
            pending.push(PendingWrite {
                name: name.to_owned(),
                location,
                value,
            });
        }
        Ok(pending)
    }

    fn apply(&mut self, write: PendingWrite) -> Result<(), Error> {
        let PendingWrite {
            name,
            location,
            value,
        } = write;
        self.select_table(location.table)?;
        if self.dummy {
            trace!("{name} = {value:?} (dummy)");
            self.shadow.insert(name, value);
            return Ok(());
        }

        let FieldLocation {
            device_id,
            offset,
            span,
            ..
        } = location;
        let bytes = match value {
            FieldValue::Raw(bytes) => bytes,
            FieldValue::Scalar(value) => {
                let mut bytes = Vec::with_capacity(span.num_bytes());
                for i in 0..span.num_bytes() {
                    let byte = if byte_fully_owned(span.byte_mask(i)) {
                        span.place(value, i)
                    } else {
                        // Bits of other fields live in this byte
                        let current = self.read_bytes(device_id, offset + i as Address, 1)?[0];
                        span.merge(current, value, i)
                    };
                    bytes.push(byte);
                }
                bytes
            }
        };
        trace!("{name} @ {location} <- {bytes:02x?}");
        self.transport.write(device_id, offset, &bytes)?;
        Ok(())
    }

    /// Read every register in the map, in map order
    ///
    /// # Errors
    ///
    /// Reading a register fails
    pub fn snapshot(&mut self) -> Result<Settings, Error> {
        let names = self
            .map
            .registers()
            .iter()
            .map(|r| r.name.clone())
            .collect::<Vec<_>>();
        self.read_fields(names)
    }

    /// Read the given registers or bit-fields, in the given order
    ///
    /// # Errors
    ///
    /// Reading a register fails
    pub fn read_fields<I, K>(&mut self, names: I) -> Result<Settings, Error>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut settings = Settings::new();
        for name in names {
            let name = name.as_ref();
            let value = self.read_field(name)?;
            settings.insert(name, value);
        }
        Ok(settings)
    }

    /// Write a `name: 0xHH` line for each of `names`, or for every register in the map if
    /// `names` is `None`
    ///
    /// # Errors
    ///
    /// - Reading a register fails
    /// - Writing to `out` fails
    pub fn save_registers(
        &mut self,
        out: impl io::Write,
        names: Option<&[&str]>,
    ) -> Result<(), SettingsError> {
        let settings = match names {
            Some(names) => self.read_fields(names)?,
            None => self.snapshot()?,
        };
        settings.write_to(out)?;
        Ok(())
    }

    /// Parse a settings file for use with [`Self::write_fields`]
    ///
    /// Names the register map does not know are skipped with a warning.
    ///
    /// # Errors
    ///
    /// See [`Settings::read_from`]
    pub fn load_registers(&self, input: impl io::BufRead) -> Result<Settings, SettingsError> {
        Settings::read_from(input, &self.map)
    }

    /// # Errors
    ///
    /// See [`Self::save_registers`]
    pub fn save_registers_to_path(
        &mut self,
        path: &path::Path,
        names: Option<&[&str]>,
    ) -> Result<(), SettingsError> {
        let settings = match names {
            Some(names) => self.read_fields(names)?,
            None => self.snapshot()?,
        };
        settings.save(path)
    }

    /// # Errors
    ///
    /// See [`Settings::load`]
    pub fn load_registers_from_path(&self, path: &path::Path) -> Result<Settings, SettingsError> {
        Settings::load(path, &self.map)
    }

    /// Collect the user-writable bit-fields whose current value differs from their reset value
    ///
    /// Fields are visited in map order. A missing reset value counts as 0. `observer` is told
    /// about every field read and about the end of the scan.
    ///
    /// # Errors
    ///
    /// Reading a field fails
    pub fn non_default_fields(
        &mut self,
        filter: &FieldFilter,
        mut observer: impl FnMut(ScanEvent<'_>),
    ) -> Result<Settings, Error> {
        let candidates = self
            .map
            .bit_fields()
            .iter()
            .filter(|field| {
                self.map
                    .register(&field.register)
                    .is_some_and(|register| filter.is_allowed(field, register))
            })
            .map(|field| (field.name.clone(), field.reset_value.unwrap_or(0)))
            .collect::<Vec<_>>();

        let mut non_default = Settings::new();
        for (name, reset_value) in &candidates {
            let value = self.read_field(name)?;
            observer(ScanEvent::Visited {
                name: name.as_str(),
                value,
                reset_value: *reset_value,
            });
            if value != *reset_value {
                non_default.insert(name.as_str(), value);
            }
        }
        observer(ScanEvent::Finished {
            visited: candidates.len(),
            non_default: non_default.len(),
        });
        info!(
            "{} non-default writable field(s) out of {} visited",
            non_default.len(),
            candidates.len()
        );
        Ok(non_default)
    }

    /// Named chip sequence from the register map, as settings ready for [`Self::write_fields`]
    ///
    /// # Errors
    ///
    /// The register map has no sequence called `name`
    pub fn chip_sequence(&self, name: &str) -> Result<Settings, Error> {
        self.map
            .chip_sequence(name)
            .map(|steps| steps.iter().map(|(reg, value)| (reg.as_str(), *value)).collect())
            .ok_or_else(|| Error::NameResolution(name.to_owned()))
    }

    /// # Errors
    ///
    /// The register map has no soft reset sequence
    pub fn soft_reset(&self) -> Result<Settings, Error> {
        self.chip_sequence(SOFT_RESET)
    }

    /// # Errors
    ///
    /// The register map has no password level 3 sequence
    pub fn password_level_3(&self) -> Result<Settings, Error> {
        self.chip_sequence(PASSWORD_LEVEL_3)
    }

    /// Write the steps of a chip sequence, in order
    ///
    /// # Errors
    ///
    /// - The sequence does not exist or names an unknown register
    /// - The transport fails
    pub fn apply_sequence(&mut self, name: &str) -> Result<(), Error> {
        let steps = self.chip_sequence(name)?;
        debug!("Applying chip sequence {name} ({} steps)", steps.len());
        self.write_fields(&steps)
    }

    /// Value to write to the debug multiplexer to route `signal` out
    pub fn test_signal(&self, signal: &str) -> Option<u64> {
        self.map.test_signal(signal)
    }

    pub fn test_signals(&self) -> impl Iterator<Item = (&str, u64)> {
        self.map
            .test_signals()
            .iter()
            .map(|(signal, address)| (signal.as_str(), *address))
    }
}

fn check_range(name: &str, location: &FieldLocation, value: &FieldValue) -> Result<(), RangeError> {
    let span = location.span;
    let num_bytes = match value {
        FieldValue::Scalar(value) => {
            if !span.fits(*value) {
                return Err(RangeError::Value {
                    name: name.to_owned(),
                    value: *value,
                    max: span.max_value(),
                });
            }
            span.num_bytes()
        }
        FieldValue::Raw(bytes) => {
            if bytes.len() > span.capacity_bytes() {
                return Err(RangeError::ByteCount {
                    name: name.to_owned(),
                    len: bytes.len(),
                    capacity: span.capacity_bytes(),
                });
            }
            bytes.len()
        }
    };
    let fits = Address::try_from(num_bytes.saturating_sub(1))
        .ok()
        .and_then(|last| location.offset.checked_add(last))
        .is_some();
    if !fits {
        return Err(RangeError::AddrOverflow {
            name: name.to_owned(),
            offset: location.offset,
            span: num_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        model::{status_map, BitFieldRecord, RegisterRecord, WriteAccess},
        transport::{MemoryBus, Operation},
    };

    const DEV: DeviceId = 0x50;

    fn accessor() -> RegisterMapAccessor<MemoryBus> {
        let bus = MemoryBus::new().with_table_select(DEV, 0x7f);
        RegisterMapAccessor::new(bus, status_map(), AccessorConfig::default())
    }

    fn bus(acc: &RegisterMapAccessor<MemoryBus>) -> &MemoryBus {
        acc.transport()
    }

    /// Table-select writes in the operation log
    fn table_selects(acc: &RegisterMapAccessor<MemoryBus>) -> Vec<u8> {
        bus(acc)
            .writes()
            .filter(|(_, address, _)| *address == 0x7f)
            .map(|(_, _, data)| data[0])
            .collect()
    }

    #[test]
    fn status_scenario() {
        let mut acc = accessor();
        acc.write_field("busy", 1).unwrap();
        assert_eq!(bus(&acc).peek(DEV, 0, 0x10), 0x08);
        acc.write_field("mode", 0b10).unwrap();
        assert_eq!(bus(&acc).peek(DEV, 0, 0x10), 0x28);
        assert_eq!(acc.read_field("busy").unwrap(), 1);
        assert_eq!(acc.read_field("mode").unwrap(), 0b10);
        assert_eq!(acc.read_field("STATUS").unwrap(), 0x28);
    }

    #[test]
    fn round_trip_at_any_alignment() {
        let spans = [(0, 1), (3, 1), (7, 1), (4, 2), (6, 4), (0, 8), (5, 8), (4, 12), (1, 16)];
        let registers = vec![
            RegisterRecord::new("TABLE_SEL", DEV, Table::Unselectable, 0x7f),
            RegisterRecord::new("WIDE", DEV, Table::Index(0), 0x30),
        ];
        let fields = spans
            .iter()
            .map(|(lsbit, len)| BitFieldRecord::new(format!("f_{lsbit}_{len}"), "WIDE", *lsbit, *len))
            .chain([
                BitFieldRecord::new("f_3_61", "WIDE", 3, 61),
                BitFieldRecord::new("f_0_64", "WIDE", 0, 64),
            ])
            .collect();
        let map = RegisterMap::from_records(registers, fields).unwrap();
        let mut acc = RegisterMapAccessor::new(MemoryBus::new(), map, AccessorConfig::default());

        for (lsbit, len) in spans {
            let name = format!("f_{lsbit}_{len}");
            let max = (1u64 << len) - 1;
            for value in [0, 1, max / 3, max / 2 + 1, max - 1, max] {
                acc.write_field(&name, value).unwrap();
                assert_eq!(acc.read_field(&name).unwrap(), value, "{name} = {value:#x}");
            }
        }
        for value in [0, 1, 0x1234_5678_9abc_def0 >> 3, (1 << 61) - 1] {
            acc.write_field("f_3_61", value).unwrap();
            assert_eq!(acc.read_field("f_3_61").unwrap(), value);
        }
        for value in [0, 0x0123_4567_89ab_cdef, u64::MAX] {
            acc.write_field("f_0_64", value).unwrap();
            assert_eq!(acc.read_field("f_0_64").unwrap(), value);
        }
    }

    #[test]
    fn neighbors_are_preserved() {
        let mut acc = accessor();
        acc.write_field("mode", 0b11).unwrap();
        for busy in [1, 0, 1] {
            acc.write_field("busy", busy).unwrap();
            assert_eq!(acc.read_field("mode").unwrap(), 0b11);
        }
        // Bits outside any field survive as well
        acc.transport_mut().poke(DEV, 1, 0x21, 0xc3);
        acc.write_field("threshold", 0xabd).unwrap();
        assert_eq!(bus(&acc).peek(DEV, 1, 0x20), 0xab);
        assert_eq!(bus(&acc).peek(DEV, 1, 0x21), 0xd3);
        assert_eq!(acc.read_field("GAIN").unwrap(), 0xd3);
    }

    #[test]
    fn partially_owned_bytes_are_read_first() {
        let mut acc = accessor();
        acc.select_table(Table::Index(1)).unwrap();
        acc.transport_mut().clear_operations();

        // threshold is 0xfff0 over two bytes: only the low byte needs a read
        acc.write_field("threshold", 0x123).unwrap();
        assert_eq!(
            bus(&acc).operations(),
            [
                Operation::Read {
                    device_id: DEV,
                    address: 0x21,
                    length: 1
                },
                Operation::Write {
                    device_id: DEV,
                    address: 0x20,
                    data: vec![0x12, 0x30]
                },
            ]
        );
    }

    #[test]
    fn out_of_range_values_are_rejected_without_writes() {
        let mut acc = accessor();
        for (name, len) in [("busy", 1u32), ("mode", 2), ("threshold", 12), ("GAIN", 8)] {
            let err = acc.write_field(name, 1u64 << len).unwrap_err();
            assert!(matches!(err, Error::Range(RangeError::Value { .. })), "{name}");
            assert!(err.is_validation());
        }
        let err = acc.write_bytes("threshold", &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            Error::Range(RangeError::ByteCount {
                len: 3,
                capacity: 2,
                ..
            })
        ));
        assert_eq!(bus(&acc).write_count(), 0);
        assert_eq!(acc.current_table(), 0);
    }

    #[test]
    fn invalid_batch_entry_prevents_all_writes() {
        let mut acc = accessor();
        let err = acc
            .write_fields([("busy", 1u64), ("threshold", 0x7ff), ("mode", 4)])
            .unwrap_err();
        assert!(matches!(err, Error::Range(RangeError::Value { ref name, .. }) if name == "mode"));
        assert!(bus(&acc).operations().is_empty());

        let err = acc
            .write_fields([("busy", 1u64), ("NOT_A_REAL_NAME", 0)])
            .unwrap_err();
        assert!(matches!(err, Error::NameResolution(ref name) if name == "NOT_A_REAL_NAME"));
        assert!(bus(&acc).operations().is_empty());
    }

    #[test]
    fn batch_is_applied_in_order() {
        let mut acc = accessor();
        acc.write_fields([("STATUS", 0xffu64), ("busy", 0)]).unwrap();
        assert_eq!(bus(&acc).peek(DEV, 0, 0x10), 0xf7);
        acc.write_fields([("busy", 1u64), ("STATUS", 0)]).unwrap();
        assert_eq!(bus(&acc).peek(DEV, 0, 0x10), 0);
    }

    #[test]
    fn transport_failure_leaves_earlier_entries_written() {
        let mut acc = accessor();
        // Writes: busy, table select, GAIN (fails), STATUS
        acc.transport_mut().fail_write_after(2);
        let err = acc
            .write_fields([("busy", 1u64), ("GAIN", 0x11), ("STATUS", 0xff)])
            .unwrap_err();
        assert!(matches!(err, Error::Transport(ref e) if e.op() == TransportOp::Write));
        assert!(!err.is_validation());
        assert_eq!(bus(&acc).peek(DEV, 0, 0x10), 0x08);
        assert_eq!(bus(&acc).peek(DEV, 1, 0x21), 0);
        assert_eq!(acc.current_table(), 1);
    }

    #[test]
    fn read_failures_pass_through() {
        let mut acc = accessor();
        acc.transport_mut().fail_next_read();
        let err = acc.read_field("STATUS").unwrap_err();
        match &err {
            Error::Transport(e) => {
                assert_eq!(e.op(), TransportOp::Read);
                assert_eq!(e.device_id(), DEV);
                assert_eq!(e.address(), 0x10);
            }
            _ => panic!("expected a transport error, got {err:?}"),
        }
    }

    #[test]
    fn table_switches_are_minimal() {
        let mut acc = accessor();
        acc.read_field("busy").unwrap();
        acc.read_field("mode").unwrap();
        assert!(table_selects(&acc).is_empty());

        acc.read_field("threshold").unwrap();
        acc.write_field("GAIN", 3).unwrap();
        assert_eq!(table_selects(&acc), [1]);
        assert_eq!(acc.current_table(), 1);

        acc.write_field("busy", 1).unwrap();
        assert_eq!(table_selects(&acc), [1, 0]);
        // The select register is unselectable, hence table 0
        acc.read_field("TABLE_SEL").unwrap();
        assert_eq!(table_selects(&acc), [1, 0]);
    }

    #[test]
    fn unknown_names_cause_no_traffic() {
        let mut acc = accessor();
        let err = acc.read_field("NOT_A_REAL_NAME").unwrap_err();
        assert!(matches!(err, Error::NameResolution(ref name) if name == "NOT_A_REAL_NAME"));
        assert!(err.is_validation());
        assert!(acc.resolve("NOT_A_REAL_NAME").is_err());
        assert!(bus(&acc).operations().is_empty());
    }

    #[test]
    fn resolve_selects_table() {
        let mut acc = accessor();
        let loc = acc.resolve("threshold").unwrap();
        assert_eq!(loc.offset, 0x20);
        assert_eq!((loc.span.lsbit(), loc.span.length()), (4, 12));
        assert_eq!(acc.current_table(), 1);
        assert_eq!(table_selects(&acc), [1]);
    }

    #[test]
    fn device_id_override_applies_everywhere() {
        let bus = MemoryBus::new().with_table_select(0x51, 0x7f);
        let mut acc = RegisterMapAccessor::new(
            bus,
            status_map(),
            AccessorConfig::default().device_id(0x51),
        );
        acc.write_field("GAIN", 0x5a).unwrap();
        assert!(acc.transport().writes().all(|(dev, _, _)| dev == 0x51));
        assert_eq!(acc.transport().peek(0x51, 1, 0x21), 0x5a);
    }

    #[test]
    fn missing_table_select_register_is_reported() {
        let map = RegisterMap::from_records(
            vec![
                RegisterRecord::new("A", DEV, Table::Index(0), 0),
                RegisterRecord::new("B", DEV, Table::Index(2), 0),
            ],
            vec![],
        )
        .unwrap()
        .with_table_select("BANK");
        let mut acc = RegisterMapAccessor::new(MemoryBus::new(), map, AccessorConfig::default());
        acc.write_field("A", 1).unwrap();
        let err = acc.write_fields([("A", 2), ("B", 1)]).unwrap_err();
        assert!(matches!(err, Error::NameResolution(ref name) if name == "BANK"));
        assert_eq!(acc.transport().write_count(), 1);
    }

    #[test]
    fn address_width_is_configured() {
        let map = status_map().with_address_width(2);
        let acc = RegisterMapAccessor::new(MemoryBus::new(), map, AccessorConfig::default());
        assert_eq!(acc.transport().address_width(), 2);
    }

    #[test]
    fn dummy_mode_skips_the_bus() {
        let defaults: Settings = [("GAIN", 7u64)].into_iter().collect();
        let mut acc = RegisterMapAccessor::new(
            MemoryBus::new(),
            status_map(),
            AccessorConfig::default().dummy(defaults),
        );
        acc.open().unwrap();
        acc.write_field("threshold", 0x123).unwrap();
        acc.write_field("mode", 2).unwrap();
        assert_eq!(acc.read_field("mode").unwrap(), 0);
        assert_eq!(acc.read_field("GAIN").unwrap(), 0);
        acc.close().unwrap();

        assert!(acc.transport().operations().is_empty());
        assert_eq!(acc.shadow().get("threshold"), Some(&FieldValue::Scalar(0x123)));
        assert_eq!(acc.shadow().get("GAIN"), Some(&FieldValue::Scalar(7)));
        // Table cache still follows the accesses
        assert_eq!(acc.current_table(), 1);

        // Validation still applies
        assert!(acc.write_field("busy", 2).is_err());
        assert!(acc.read_field("NOT_A_REAL_NAME").is_err());
    }

    #[test]
    fn open_and_close_reach_the_transport() {
        let mut acc = accessor();
        acc.open().unwrap();
        acc.close().unwrap();
        assert_eq!(bus(&acc).operations(), [Operation::Open, Operation::Close]);
    }

    #[test]
    fn save_then_load_reproduces_state() {
        let mut acc = accessor();
        acc.write_fields([("STATUS", 0x28u64), ("CTRL", 0xab), ("GAIN", 0xc0)])
            .unwrap();
        let mut saved = Vec::new();
        acc.save_registers(&mut saved, None).unwrap();
        assert_eq!(
            String::from_utf8(saved.clone()).unwrap(),
            indoc! {"
                TABLE_SEL: 0x00
                STATUS: 0x28
                CTRL: 0xAB
                GAIN: 0xC0
            "}
        );

        let mut other = accessor();
        let settings = other.load_registers(saved.as_slice()).unwrap();
        other.write_fields(&settings).unwrap();
        let mut restored = Vec::new();
        other.save_registers(&mut restored, None).unwrap();
        assert_eq!(saved, restored);
    }

    #[test]
    fn save_selected_names() {
        let mut acc = accessor();
        acc.write_field("mode", 3).unwrap();
        let mut saved = Vec::new();
        acc.save_registers(&mut saved, Some(&["mode", "busy"])).unwrap();
        assert_eq!(String::from_utf8(saved).unwrap(), "mode: 0x03\nbusy: 0x00\n");
    }

    #[test]
    fn non_default_fields_reports_changes() {
        let mut acc = accessor();
        acc.write_fields([
            ("busy", 1u64),
            ("mode", 1),
            ("threshold", 0x81),
            ("tb_override", 1),
        ])
        .unwrap();

        let mut visited = vec![];
        let mut finished = None;
        let changed = acc
            .non_default_fields(&FieldFilter::all(), |event| match event {
                ScanEvent::Visited { name, .. } => visited.push(name.to_owned()),
                ScanEvent::Finished {
                    visited,
                    non_default,
                } => finished = Some((visited, non_default)),
            })
            .unwrap();
        assert_eq!(visited, ["busy", "mode", "threshold"]);
        assert_eq!(finished, Some((3, 2)));
        assert_eq!(
            changed.iter().collect::<Vec<_>>(),
            [("busy", 1), ("threshold", 0x81)]
        );

        let changed = acc
            .non_default_fields(&FieldFilter::all().tables([0]), |_| {})
            .unwrap();
        assert_eq!(changed.names().collect::<Vec<_>>(), ["busy"]);
    }

    #[test]
    fn non_default_skips_fields_without_write_access() {
        let map = RegisterMap::from_records(
            vec![RegisterRecord::new("R", DEV, Table::Index(0), 0)],
            vec![
                BitFieldRecord::new("ro", "R", 0, 4),
                BitFieldRecord::new("na", "R", 4, 2)
                    .with_write_access(WriteAccess::Other("n/a".to_owned())),
                BitFieldRecord::new("rw", "R", 6, 2).with_write_access(WriteAccess::Pw3),
            ],
        )
        .unwrap();
        let mut bus = MemoryBus::new();
        bus.poke(DEV, 0, 0, 0xff);
        let mut acc = RegisterMapAccessor::new(bus, map, AccessorConfig::default());
        let changed = acc.non_default_fields(&FieldFilter::all(), |_| {}).unwrap();
        assert_eq!(changed.iter().collect::<Vec<_>>(), [("rw", 3)]);
    }

    #[test]
    fn chip_sequences_are_applied_in_order() {
        let map = status_map()
            .with_chip_sequence(
                "SOFT_RESET",
                vec![("GAIN".to_owned(), 0x5d), ("STATUS".to_owned(), 0x8b)],
            )
            .with_test_signal("tx_enable", 3);
        let bus = MemoryBus::new().with_table_select(DEV, 0x7f);
        let mut acc = RegisterMapAccessor::new(bus, map, AccessorConfig::default());

        assert_eq!(acc.soft_reset().unwrap().get("GAIN"), Some(0x5d));
        assert!(matches!(acc.password_level_3(), Err(Error::NameResolution(_))));
        acc.apply_sequence("SOFT_RESET").unwrap();
        assert_eq!(acc.transport().peek(DEV, 1, 0x21), 0x5d);
        assert_eq!(acc.transport().peek(DEV, 0, 0x10), 0x8b);
        assert_eq!(table_selects(&acc), [1, 0]);

        assert_eq!(acc.test_signal("tx_enable"), Some(3));
        assert_eq!(acc.test_signal("rx_enable"), None);
        assert_eq!(acc.test_signals().collect::<Vec<_>>(), [("tx_enable", 3)]);
    }

    #[test]
    fn raw_bytes_are_written_unmasked() {
        let mut acc = accessor();
        acc.transport_mut().poke(DEV, 1, 0x21, 0xff);
        acc.write_bytes("threshold", &[0x12, 0x34]).unwrap();
        assert_eq!(
            bus(&acc).operations(),
            [
                Operation::Write {
                    device_id: DEV,
                    address: 0x7f,
                    data: vec![1]
                },
                Operation::Write {
                    device_id: DEV,
                    address: 0x20,
                    data: vec![0x12, 0x34]
                },
            ]
        );
        assert_eq!(bus(&acc).peek(DEV, 1, 0x20), 0x12);
        assert_eq!(bus(&acc).peek(DEV, 1, 0x21), 0x34);
        assert_eq!(acc.read_field("threshold").unwrap(), 0x123);

        // Fewer bytes than the field spans only touch the leading bytes
        acc.write_bytes("threshold", &[0xab]).unwrap();
        assert_eq!(bus(&acc).peek(DEV, 1, 0x20), 0xab);
        assert_eq!(bus(&acc).peek(DEV, 1, 0x21), 0x34);
    }

    #[test]
    fn dummy_mode_records_raw_bytes() {
        let mut acc = RegisterMapAccessor::new(
            MemoryBus::new(),
            status_map(),
            AccessorConfig::default().dummy(Settings::new()),
        );
        acc.write_bytes("GAIN", &[0x7f]).unwrap();
        acc.write_fields([("threshold", vec![0x01u8, 0x02])]).unwrap();
        assert!(acc.transport().operations().is_empty());
        assert_eq!(acc.shadow().get("GAIN"), Some(&FieldValue::Raw(vec![0x7f])));
        assert_eq!(
            acc.shadow().get("threshold"),
            Some(&FieldValue::Raw(vec![0x01, 0x02]))
        );
        assert!(acc.write_bytes("GAIN", &[1, 2]).is_err());
    }

    #[test]
    fn settings_files_round_trip_through_disk() {
        use fs_err as fs;

        let dir = std::env::temp_dir().join(format!("regmap-settings-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let map_path = dir.join("map.json");
        let settings_path = dir.join("settings.txt");
        fs::write(
            &map_path,
            r#"{
                "registers": {
                    "TABLE_SEL": { "device_id": 80, "table": -1, "offset": 127 },
                    "STATUS": { "device_id": 80, "table": 0, "offset": 16 },
                    "CTRL": { "device_id": 80, "table": 1, "offset": 32 }
                },
                "bit_fields": {
                    "mode": { "register": "STATUS", "justification": 4, "length": 2 }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(crate::load_map(&map_path).unwrap().registers().len(), 3);
        assert!(matches!(
            crate::load_map(&dir.join("missing.json")),
            Err(LoadError::Io(_))
        ));

        let new_bus = || MemoryBus::new().with_table_select(DEV, 0x7f);
        let mut acc =
            RegisterMapAccessor::from_path(new_bus(), &map_path, AccessorConfig::default()).unwrap();
        acc.write_fields([("STATUS", 0x28u64), ("CTRL", 0x9c)]).unwrap();
        acc.save_registers_to_path(&settings_path, None).unwrap();
        assert_eq!(
            fs::read_to_string(&settings_path).unwrap(),
            "TABLE_SEL: 0x00\nSTATUS: 0x28\nCTRL: 0x9C\n"
        );

        let mut other =
            RegisterMapAccessor::from_path(new_bus(), &map_path, AccessorConfig::default()).unwrap();
        let settings = other.load_registers_from_path(&settings_path).unwrap();
        other.write_fields(&settings).unwrap();
        assert_eq!(other.read_field("mode").unwrap(), 0b10);
        assert_eq!(other.snapshot().unwrap(), acc.snapshot().unwrap());

        acc.save_registers_to_path(&settings_path, Some(&["mode"])).unwrap();
        assert_eq!(fs::read_to_string(&settings_path).unwrap(), "mode: 0x02\n");

        fs::remove_dir_all(&dir).unwrap();
    }
}
