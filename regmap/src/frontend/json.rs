//! JSON register map database
//!
//! Both the current key names and the legacy ones exported by the memory map spreadsheet
//! tooling (`memory_map`, `bit_field`, `deviceID`, `POR`, ...) are accepted.

use json::JsonValue;
use log::{debug, warn};

use crate::{
    error::LoadError,
    model::{Address, BitFieldRecord, DeviceId, RegisterMap, RegisterRecord, Table, WriteAccess},
    util,
};

/// Top-level key aliases, current name first
const REGISTERS: &[&str] = &["registers", "memory_map"];
const BIT_FIELDS: &[&str] = &["bit_fields", "bit_field"];
const ADDRESS_WIDTH: &[&str] = &["address_width_bytes", "NUM_I2C_ADDR_BYTES"];
const TABLE_SELECT: &[&str] = &["table_select"];
const TEST_SIGNALS: &[&str] = &["test_signals"];
const CHIP_SEQUENCES: &[&str] = &["chip_sequences"];

/// Record attribute aliases
const DEVICE_ID: &[&str] = &["device_id", "deviceID"];
const TABLE: &[&str] = &["table"];
const OFFSET: &[&str] = &["offset"];
const RESET_VALUE: &[&str] = &["reset_value", "POR"];
const REGISTER: &[&str] = &["register"];
const JUSTIFICATION: &[&str] = &["justification"];
const LENGTH: &[&str] = &["length"];
const WRITE_ACCESS: &[&str] = &["write_access"];
const SIGNAL: &[&str] = &["signal", "fromXLS"];
const SIGNAL_ADDRESS: &[&str] = &["address"];

/// First non-null value among `keys`
fn get<'a>(obj: &'a JsonValue, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter().map(|k| &obj[*k]).find(|v| !v.is_null())
}

fn expect_object<'a>(value: &'a JsonValue, context: &str) -> Result<&'a JsonValue, LoadError> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(LoadError::UnexpectedType {
            context: context.to_owned(),
            expected: "object",
        })
    }
}

/// Integers may be JSON numbers or strings carrying a base prefix, e.g., `"0x1f"`
fn as_u64(value: &JsonValue) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(util::parse_nonneg_int))
}

fn required_u64(
    obj: &JsonValue,
    record: &str,
    attr: &'static [&'static str],
) -> Result<u64, LoadError> {
    let value = get(obj, attr).ok_or_else(|| LoadError::MissingAttribute {
        record: record.to_owned(),
        attr: attr[0],
    })?;
    as_u64(value).ok_or_else(|| invalid(record, attr[0], value))
}

fn required_narrow<T: TryFrom<u64>>(
    obj: &JsonValue,
    record: &str,
    attr: &'static [&'static str],
) -> Result<T, LoadError> {
    let value = required_u64(obj, record, attr)?;
    T::try_from(value).map_err(|_| LoadError::InvalidAttribute {
        record: record.to_owned(),
        attr: attr[0],
        value: value.to_string(),
    })
}

fn optional_u64(
    obj: &JsonValue,
    record: &str,
    attr: &'static [&'static str],
) -> Result<Option<u64>, LoadError> {
    get(obj, attr)
        .map(|value| as_u64(value).ok_or_else(|| invalid(record, attr[0], value)))
        .transpose()
}

fn invalid(record: &str, attr: &'static str, value: &JsonValue) -> LoadError {
    LoadError::InvalidAttribute {
        record: record.to_owned(),
        attr,
        value: value.dump(),
    }
}

/// Parse a table reference
///
/// Negative numbers and strings denote registers outside any selectable table.
fn parse_table(obj: &JsonValue, record: &str) -> Result<Table, LoadError> {
    let Some(value) = get(obj, TABLE) else {
        return Err(LoadError::MissingAttribute {
            record: record.to_owned(),
            attr: TABLE[0],
        });
    };
    if value.is_string() {
        debug!("register {record} has symbolic table {value}, treating as unselectable");
        return Ok(Table::Unselectable);
    }
    match value.as_i64() {
        Some(idx) if idx < 0 => Ok(Table::Unselectable),
        Some(idx) => u8::try_from(idx)
            .map(Table::Index)
            .map_err(|_| invalid(record, TABLE[0], value)),
        None => Err(invalid(record, TABLE[0], value)),
    }
}

fn parse_register(name: &str, obj: &JsonValue) -> Result<RegisterRecord, LoadError> {
    let obj = expect_object(obj, name)?;
    let device_id: DeviceId = required_narrow(obj, name, DEVICE_ID)?;
    let table = parse_table(obj, name)?;
    let offset: Address = required_narrow(obj, name, OFFSET)?;
    let mut reg = RegisterRecord::new(name, device_id, table, offset);
    reg.reset_value = optional_u64(obj, name, RESET_VALUE)?;
    Ok(reg)
}

fn parse_bit_field(name: &str, obj: &JsonValue) -> Result<BitFieldRecord, LoadError> {
    let obj = expect_object(obj, name)?;
    let register = get(obj, REGISTER)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| LoadError::MissingAttribute {
            record: name.to_owned(),
            attr: REGISTER[0],
        })?;
    let justification: u32 = required_narrow(obj, name, JUSTIFICATION)?;
    let length: u32 = required_narrow(obj, name, LENGTH)?;
    let mut field = BitFieldRecord::new(name, register, justification, length);
    field.write_access = get(obj, WRITE_ACCESS)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        // `WriteAccess` parsing is infallible thanks to the catch-all variant
        .and_then(|s| s.parse::<WriteAccess>().ok());
    field.reset_value = optional_u64(obj, name, RESET_VALUE)?;
    Ok(field)
}

/// Sequences are arrays of `[register, value]` pairs so that their order survives
fn parse_chip_sequence(name: &str, value: &JsonValue) -> Result<Vec<(String, u64)>, LoadError> {
    if !value.is_array() {
        return Err(LoadError::UnexpectedType {
            context: format!("chip sequence {name}"),
            expected: "array",
        });
    }
    value
        .members()
        .map(|step| {
            let reg = step[0].as_str();
            let val = as_u64(&step[1]);
            match (reg, val) {
                (Some(reg), Some(val)) if step.len() == 2 => Ok((reg.to_owned(), val)),
                _ => Err(invalid(name, "step", step)),
            }
        })
        .collect()
}

fn for_each_entry(
    root: &JsonValue,
    keys: &[&str],
    mut f: impl FnMut(&str, &JsonValue) -> Result<(), LoadError>,
) -> Result<(), LoadError> {
    let Some(section) = get(root, keys) else {
        return Ok(());
    };
    let section = expect_object(section, keys[0])?;
    for (name, value) in section.entries() {
        f(name, value)?;
    }
    Ok(())
}

pub(crate) fn parse_register_map(text: &str) -> Result<RegisterMap, LoadError> {
    let root = json::parse(text)?;
    let root = expect_object(&root, "register map")?;

    let mut registers = vec![];
    for_each_entry(root, REGISTERS, |name, obj| {
        registers.push(parse_register(name, obj)?);
        Ok(())
    })?;
    if registers.is_empty() {
        warn!("register map does not define any registers");
    }

    let mut bit_fields = vec![];
    for_each_entry(root, BIT_FIELDS, |name, obj| {
        bit_fields.push(parse_bit_field(name, obj)?);
        Ok(())
    })?;

    let mut map = RegisterMap::from_records(registers, bit_fields)?;

    if let Some(width) = get(root, ADDRESS_WIDTH) {
        let width = as_u64(width)
            .and_then(|w| u8::try_from(w).ok())
            .filter(|w| (1..=4).contains(w))
            .ok_or_else(|| invalid("register map", ADDRESS_WIDTH[0], width))?;
        map = map.with_address_width(width);
    }

    if let Some(reg) = get(root, TABLE_SELECT).and_then(JsonValue::as_str) {
        map = map.with_table_select(reg);
    }

    let mut signals = vec![];
    for_each_entry(root, TEST_SIGNALS, |entry, obj| {
        let obj = expect_object(obj, entry)?;
        let signal = get(obj, SIGNAL)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| LoadError::MissingAttribute {
                record: entry.to_owned(),
                attr: SIGNAL[0],
            })?;
        let address = required_u64(obj, entry, SIGNAL_ADDRESS)?;
        signals.push((signal.to_owned(), address));
        Ok(())
    })?;
    for (signal, address) in signals {
        map = map.with_test_signal(signal, address);
    }

    let mut sequences = vec![];
    for_each_entry(root, CHIP_SEQUENCES, |name, value| {
        sequences.push((name.to_owned(), parse_chip_sequence(name, value)?));
        Ok(())
    })?;
    for (name, steps) in sequences {
        map = map.with_chip_sequence(name, steps);
    }

    debug!(
        "parsed register map: {} registers, {} bit-fields",
        map.registers().len(),
        map.bit_fields().len()
    );
    Ok(map)
}

#[cfg(test)]
const MAP_JSON: &str = r#"{
    "address_width_bytes": 1,
    "registers": {
        "TABLE_SEL": { "device_id": 80, "table": -1, "offset": 127 },
        "STATUS": { "device_id": 80, "table": 0, "offset": "0x10", "reset_value": 0 },
        "CTRL": { "device_id": 80, "table": 1, "offset": 32 }
    },
    "bit_fields": {
        "busy": { "register": "STATUS", "justification": 3, "length": 1, "write_access": "ALL", "reset_value": 0 },
        "mode": { "register": "STATUS", "justification": 4, "length": 2, "write_access": "n/a" },
        "threshold": { "register": "CTRL", "justification": 4, "length": 12, "write_access": "" }
    },
    "test_signals": {
        "DIG_DEBUG_TX_ENABLE_SEL": { "signal": "tx_enable", "address": 3 }
    },
    "chip_sequences": {
        "SOFT_RESET": [["PWE_3", "0x5D"], ["TABLE_SEL", 139]]
    }
}"#;

#[test]
fn parse_register_map_works() {
    let map = parse_register_map(MAP_JSON).unwrap();

    let names = map.registers().iter().map(|r| r.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["TABLE_SEL", "STATUS", "CTRL"]);
    assert_eq!(map.register("TABLE_SEL").unwrap().table, Table::Unselectable);
    assert_eq!(map.register("STATUS").unwrap().offset, 0x10);
    assert_eq!(map.register("CTRL").unwrap().table, Table::Index(1));

    let busy = map.bit_field("busy").unwrap();
    assert_eq!(busy.write_access, Some(WriteAccess::All));
    assert_eq!(busy.reset_value, Some(0));
    assert_eq!(
        map.bit_field("mode").unwrap().write_access,
        Some(WriteAccess::Other("n/a".to_owned()))
    );
    assert_eq!(map.bit_field("threshold").unwrap().write_access, None);

    assert_eq!(map.test_signal("tx_enable"), Some(3));
    assert_eq!(
        map.chip_sequence("SOFT_RESET").unwrap(),
        [("PWE_3".to_owned(), 0x5d), ("TABLE_SEL".to_owned(), 139)]
    );
    assert_eq!(map.address_width_bytes(), 1);
    assert_eq!(map.table_select(), "TABLE_SEL");
}

#[test]
fn legacy_key_names_are_accepted() {
    let map = parse_register_map(
        r#"{
            "NUM_I2C_ADDR_BYTES": 2,
            "memory_map": { "TABLE_SEL": { "deviceID": 81, "table": "n/a", "offset": 127 } },
            "bit_field": { "tsel": { "register": "TABLE_SEL", "justification": 0, "length": 8, "POR": 4 } },
            "test_signals": { "X": { "fromXLS": "sig", "address": 7 } }
        }"#,
    )
    .unwrap();
    assert_eq!(map.address_width_bytes(), 2);
    let reg = map.register("TABLE_SEL").unwrap();
    assert_eq!(reg.device_id, 81);
    assert_eq!(reg.table, Table::Unselectable);
    assert_eq!(map.bit_field("tsel").unwrap().reset_value, Some(4));
    assert_eq!(map.test_signal("sig"), Some(7));
}

#[test]
fn missing_and_invalid_attributes_are_reported() {
    let err = parse_register_map(r#"{ "registers": { "R": { "table": 0, "offset": 1 } } }"#);
    assert!(matches!(
        err,
        Err(LoadError::MissingAttribute { record, attr: "device_id" }) if record == "R"
    ));

    let err = parse_register_map(
        r#"{ "registers": { "R": { "device_id": 300, "table": 0, "offset": 1 } } }"#,
    );
    assert!(matches!(err, Err(LoadError::InvalidAttribute { attr: "device_id", .. })));

    let err = parse_register_map(
        r#"{ "registers": { "R": { "device_id": 1, "table": 256, "offset": 1 } } }"#,
    );
    assert!(matches!(err, Err(LoadError::InvalidAttribute { attr: "table", .. })));

    assert!(matches!(parse_register_map("[1, 2]"), Err(LoadError::UnexpectedType { .. })));
    assert!(matches!(parse_register_map("{ nope"), Err(LoadError::Json(_))));
}
