//! Byte-oriented bus abstraction used by the accessor

mod memory;

pub use memory::{MemoryBus, Operation};

use crate::{
    error::TransportError,
    model::{Address, DeviceId},
};

/// A bus capable of reading and writing runs of bytes at a device address
///
/// Implementations wrap a concrete bus driver (USB-to-I2C bridge, SMBus, SPI, ...). Every call
/// blocks until the transfer has completed. Timeouts and retries, if any, are the
/// implementation's business.
pub trait ByteTransport {
    /// Read `length` consecutive bytes starting at `address`
    ///
    /// Always returns a sequence, even for single-byte reads.
    fn read(
        &mut self,
        device_id: DeviceId,
        address: Address,
        length: usize,
    ) -> Result<Vec<u8>, TransportError>;

    /// Write `data` to consecutive addresses starting at `address`
    fn write(
        &mut self,
        device_id: DeviceId,
        address: Address,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Configure how many bytes are used to transmit a memory address
    fn set_address_width(&mut self, bytes: u8);

    fn open(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T: ByteTransport + ?Sized> ByteTransport for &mut T {
    fn read(
        &mut self,
        device_id: DeviceId,
        address: Address,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).read(device_id, address, length)
    }

    fn write(
        &mut self,
        device_id: DeviceId,
        address: Address,
        data: &[u8],
    ) -> Result<(), TransportError> {
        (**self).write(device_id, address, data)
    }

    fn set_address_width(&mut self, bytes: u8) {
        (**self).set_address_width(bytes);
    }

    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}
