//! In-memory bus
//!
//! Simulates a set of devices whose register space is split into banks, selected by writing a
//! table-select register. Used as a recording mock in tests and as an offline device image by
//! the command-line front end.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use json::JsonValue;
use log::trace;
use thiserror::Error;

use crate::{
    error::{LoadError, TransportError, TransportOp},
    model::{Address, DeviceId},
    transport::ByteTransport,
    util,
};

/// Records a bus transaction performed on a [`MemoryBus`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Read {
        device_id: DeviceId,
        address: Address,
        length: usize,
    },
    Write {
        device_id: DeviceId,
        address: Address,
        data: Vec<u8>,
    },
    Open,
    Close,
}

#[derive(Error, Debug)]
enum MemoryBusError {
    #[error("address {address:#x} does not fit in {width} address byte(s)")]
    AddressOutOfRange { address: u64, width: u8 },
    #[error("injected fault")]
    Injected,
}

#[derive(Clone, Debug)]
pub struct MemoryBus {
    /// Byte values by (device, bank, address); absent cells read as zero
    cells: BTreeMap<(DeviceId, u8, Address), u8>,
    /// Active bank by device
    banks: HashMap<DeviceId, u8>,
    /// Location of the table-select register, if banking is simulated
    table_select: Option<(DeviceId, Address)>,
    address_width: u8,
    operations: Vec<Operation>,
    /// Number of reads to let through before failing one
    read_fault: Option<usize>,
    /// Number of writes to let through before failing one
    write_fault: Option<usize>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            cells: BTreeMap::new(),
            banks: HashMap::new(),
            table_select: None,
            address_width: 1,
            operations: vec![],
            read_fault: None,
            write_fault: None,
        }
    }

    /// Simulate banked register space: a write to `offset` on `device_id` selects the bank
    /// named by the first written byte
    #[must_use]
    pub fn with_table_select(mut self, device_id: DeviceId, offset: Address) -> Self {
        self.table_select = Some((device_id, offset));
        self
    }

    /// Bank of `address` on `device_id`; the table-select register itself is not banked
    fn bank_of(&self, device_id: DeviceId, address: Address) -> u8 {
        if self.table_select == Some((device_id, address)) {
            0
        } else {
            self.banks.get(&device_id).copied().unwrap_or(0)
        }
    }

    /// Location of the simulated table-select register
    pub const fn table_select(&self) -> Option<(DeviceId, Address)> {
        self.table_select
    }

    /// Currently selected bank of `device_id`
    pub fn bank(&self, device_id: DeviceId) -> u8 {
        self.banks.get(&device_id).copied().unwrap_or(0)
    }

    /// Set a byte directly, bypassing the operation log
    pub fn poke(&mut self, device_id: DeviceId, bank: u8, address: Address, value: u8) {
        self.cells.insert((device_id, bank, address), value);
    }

    /// Get a byte directly, bypassing the operation log
    pub fn peek(&self, device_id: DeviceId, bank: u8, address: Address) -> u8 {
        self.cells
            .get(&(device_id, bank, address))
            .copied()
            .unwrap_or(0)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn clear_operations(&mut self) {
        self.operations.clear();
    }

    /// Writes in the operation log, in order
    pub fn writes(&self) -> impl Iterator<Item = (DeviceId, Address, &[u8])> {
        self.operations.iter().filter_map(|op| match op {
            Operation::Write {
                device_id,
                address,
                data,
            } => Some((*device_id, *address, data.as_slice())),
            _ => None,
        })
    }

    pub fn read_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Read { .. }))
            .count()
    }

    pub fn write_count(&self) -> usize {
        self.writes().count()
    }

    pub fn address_width(&self) -> u8 {
        self.address_width
    }

    /// Make the next read fail with a transport error
    pub fn fail_next_read(&mut self) {
        self.read_fault = Some(0);
    }

    /// Make the next write fail with a transport error
    pub fn fail_next_write(&mut self) {
        self.write_fault = Some(0);
    }

    /// Let `count` writes succeed, then fail the one after
    pub fn fail_write_after(&mut self, count: usize) {
        self.write_fault = Some(count);
    }

    fn check_range(
        &self,
        op: TransportOp,
        device_id: DeviceId,
        address: Address,
        length: usize,
    ) -> Result<(), TransportError> {
        let limit = 1u64 << (8 * u32::from(self.address_width.min(4)));
        let last = u64::from(address) + (length.max(1) as u64) - 1;
        if last >= limit {
            return Err(TransportError::new(
                op,
                device_id,
                address,
                MemoryBusError::AddressOutOfRange {
                    address: last,
                    width: self.address_width,
                },
            ));
        }
        Ok(())
    }

    /// Serialize the bus contents into a JSON image
    pub fn to_json(&self) -> String {
        let mut image = JsonValue::new_object();
        image["address_width"] = self.address_width.into();
        if let Some((device_id, offset)) = self.table_select {
            let mut select = JsonValue::new_object();
            select["device_id"] = device_id.into();
            select["offset"] = offset.into();
            image["table_select"] = select;
        }
        image["banks"] = self
            .banks
            .iter()
            .sorted()
            .map(|(device_id, bank)| JsonValue::Array(vec![(*device_id).into(), (*bank).into()]))
            .collect::<Vec<_>>()
            .into();
        image["cells"] = self
            .cells
            .iter()
            .map(|((device_id, bank, address), value)| {
                JsonValue::Array(vec![
                    (*device_id).into(),
                    (*bank).into(),
                    (*address).into(),
                    (*value).into(),
                ])
            })
            .collect::<Vec<_>>()
            .into();
        image.pretty(2)
    }

    /// Restore a bus from a JSON image written by [`Self::to_json`]
    ///
    /// # Errors
    ///
    /// The text is not valid JSON or does not have the shape of a bus image
    pub fn from_json_str(text: &str) -> Result<Self, LoadError> {
        let image = json::parse(text)?;
        if !image.is_object() {
            return Err(LoadError::UnexpectedType {
                context: "memory image".to_owned(),
                expected: "object",
            });
        }
        let mut bus = Self::new();
        if !image["address_width"].is_null() {
            bus.address_width = image["address_width"]
                .as_u8()
                .ok_or_else(|| invalid_image("address_width", &image["address_width"]))?;
        }
        let select = &image["table_select"];
        if !select.is_null() {
            let device_id = select["device_id"].as_u8();
            let offset = select["offset"].as_u32();
            match (device_id, offset) {
                (Some(device_id), Some(offset)) => bus.table_select = Some((device_id, offset)),
                _ => return Err(invalid_image("table_select", select)),
            }
        }
        for entry in image["banks"].members() {
            match (entry[0].as_u8(), entry[1].as_u8()) {
                (Some(device_id), Some(bank)) => {
                    bus.banks.insert(device_id, bank);
                }
                _ => return Err(invalid_image("banks", entry)),
            }
        }
        for entry in image["cells"].members() {
            let address = entry[2].as_u32().or_else(|| {
                entry[2]
                    .as_str()
                    .and_then(util::parse_nonneg_int)
                    .and_then(|a| a.try_into().ok())
            });
            match (entry[0].as_u8(), entry[1].as_u8(), address, entry[3].as_u8()) {
                (Some(device_id), Some(bank), Some(address), Some(value)) => {
                    bus.cells.insert((device_id, bank, address), value);
                }
                _ => return Err(invalid_image("cells", entry)),
            }
        }
        Ok(bus)
    }
}

/// Count down a pending fault, returning whether it fires now
fn trip(fault: &mut Option<usize>) -> bool {
    match *fault {
        Some(0) => {
            *fault = None;
            true
        }
        Some(n) => {
            *fault = Some(n - 1);
            false
        }
        None => false,
    }
}

fn invalid_image(attr: &'static str, value: &JsonValue) -> LoadError {
    LoadError::InvalidAttribute {
        record: "memory image".to_owned(),
        attr,
        value: value.dump(),
    }
}

impl ByteTransport for MemoryBus {
    fn read(
        &mut self,
        device_id: DeviceId,
        address: Address,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.operations.push(Operation::Read {
            device_id,
            address,
            length,
        });
        if trip(&mut self.read_fault) {
            return Err(TransportError::new(
                TransportOp::Read,
                device_id,
                address,
                MemoryBusError::Injected,
            ));
        }
        self.check_range(TransportOp::Read, device_id, address, length)?;
        let data = (0..length as Address)
            .map(|i| {
                let addr = address + i;
                self.peek(device_id, self.bank_of(device_id, addr), addr)
            })
            .collect::<Vec<_>>();
        trace!("read {device_id:#04x}@{address:#x}: {data:02x?}");
        Ok(data)
    }

    fn write(
        &mut self,
        device_id: DeviceId,
        address: Address,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.operations.push(Operation::Write {
            device_id,
            address,
            data: data.to_vec(),
        });
        if trip(&mut self.write_fault) {
            return Err(TransportError::new(
                TransportOp::Write,
                device_id,
                address,
                MemoryBusError::Injected,
            ));
        }
        self.check_range(TransportOp::Write, device_id, address, data.len())?;
        trace!("write {device_id:#04x}@{address:#x}: {data:02x?}");
        for (i, byte) in data.iter().enumerate() {
            let addr = address + i as Address;
            let bank = self.bank_of(device_id, addr);
            self.cells.insert((device_id, bank, addr), *byte);
            if self.table_select == Some((device_id, addr)) {
                self.banks.insert(device_id, *byte);
            }
        }
        Ok(())
    }

    fn set_address_width(&mut self, bytes: u8) {
        self.address_width = bytes;
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.operations.push(Operation::Open);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.operations.push(Operation::Close);
        Ok(())
    }
}

#[test]
fn unset_bytes_read_as_zero() {
    let mut bus = MemoryBus::new();
    assert_eq!(bus.read(0x50, 0x10, 3).unwrap(), [0, 0, 0]);
    bus.poke(0x50, 0, 0x11, 0xab);
    assert_eq!(bus.read(0x50, 0x10, 3).unwrap(), [0, 0xab, 0]);
    assert_eq!(bus.read_count(), 2);
}

#[test]
fn table_select_switches_banks() {
    let mut bus = MemoryBus::new().with_table_select(0x50, 0x7f);
    bus.write(0x50, 0x20, &[0x11]).unwrap();
    bus.write(0x50, 0x7f, &[1]).unwrap();
    assert_eq!(bus.bank(0x50), 1);
    bus.write(0x50, 0x20, &[0x22]).unwrap();

    assert_eq!(bus.peek(0x50, 0, 0x20), 0x11);
    assert_eq!(bus.peek(0x50, 1, 0x20), 0x22);
    assert_eq!(bus.read(0x50, 0x20, 1).unwrap(), [0x22]);
    // Other devices keep their own bank
    assert_eq!(bus.bank(0x51), 0);
    // The select register reads back from any bank
    assert_eq!(bus.read(0x50, 0x7f, 1).unwrap(), [1]);
}

#[test]
fn address_width_is_enforced() {
    let mut bus = MemoryBus::new();
    assert!(bus.read(0x50, 0xff, 1).is_ok());
    let err = bus.read(0x50, 0xff, 2).unwrap_err();
    assert_eq!(err.op(), TransportOp::Read);
    bus.set_address_width(2);
    assert!(bus.write(0x50, 0x1234, &[1, 2]).is_ok());
    assert!(bus.write(0x50, 0xffff, &[1, 2]).is_err());
}

#[test]
fn injected_faults_fire_once() {
    let mut bus = MemoryBus::new();
    bus.fail_next_write();
    let err = bus.write(0x50, 0, &[1]).unwrap_err();
    assert_eq!(err.op(), TransportOp::Write);
    assert_eq!(err.device_id(), 0x50);
    assert!(bus.write(0x50, 0, &[1]).is_ok());

    bus.fail_next_read();
    assert!(bus.read(0x50, 0, 1).is_err());
    assert_eq!(bus.read(0x50, 0, 1).unwrap(), [1]);

    bus.fail_write_after(1);
    assert!(bus.write(0x50, 1, &[2]).is_ok());
    assert!(bus.write(0x50, 2, &[3]).is_err());
    assert!(bus.write(0x50, 3, &[4]).is_ok());
    assert_eq!(bus.write_count(), 5);
}

#[test]
fn json_image_restores_state() {
    let mut bus = MemoryBus::new().with_table_select(0x50, 0x7f);
    bus.set_address_width(2);
    bus.write(0x50, 0x7f, &[2]).unwrap();
    bus.write(0x50, 0x100, &[0xca, 0xfe]).unwrap();

    let restored = MemoryBus::from_json_str(&bus.to_json()).unwrap();
    assert_eq!(restored.address_width(), 2);
    assert_eq!(restored.bank(0x50), 2);
    assert_eq!(restored.peek(0x50, 2, 0x100), 0xca);
    assert_eq!(restored.peek(0x50, 2, 0x101), 0xfe);
    assert!(restored.operations().is_empty());

    assert!(MemoryBus::from_json_str(r#"{ "cells": [[1, 2]] }"#).is_err());
}
