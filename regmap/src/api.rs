//! Exposes functionality supported by this crate
use std::path;

use log::info;

pub use crate::accessor::{AccessorConfig, FieldValue, RegisterMapAccessor, ScanEvent};
pub use crate::bits::{byte_fully_owned, BitSpan};
pub use crate::error::{Error, LoadError, RangeError, SettingsError, TransportError, TransportOp};
pub use crate::filtering::FieldFilter;
pub use crate::model::{
    coerce_to_table_zero, Address, BitFieldRecord, DeviceId, FieldLocation, RegisterMap,
    RegisterRecord, Resolution, Table, WriteAccess, DEFAULT_TABLE_SELECT,
};
pub use crate::settings::Settings;
pub use crate::transport::{ByteTransport, MemoryBus, Operation};

/// Load a register map from a JSON database at `path`
///
/// # Errors
///
/// - The file cannot be read
/// - The file is not valid JSON or does not describe a consistent register map
pub fn load_map(path: &path::Path) -> Result<RegisterMap, LoadError> {
    let map = RegisterMap::from_path(path)?;
    info!(
        "Loaded {} registers and {} bit-fields from {}",
        map.registers().len(),
        map.bit_fields().len(),
        path.display()
    );
    Ok(map)
}
