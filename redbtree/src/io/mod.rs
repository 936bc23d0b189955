//! Byte-device abstractions for RedBTree.
//!
//! The engine performs positioned reads and writes against a [`Device`]
//! rather than a file directly, which allows alternative backends (an
//! in-memory device for tests, for example) to be swapped in without
//! touching the engine.

use std::fmt::Debug;
use std::ops::{Deref, DerefMut};

use byteorder::{BigEndian, ByteOrder};

use crate::error::Error;

/// Filesystem IO provided by `std::fs`.
pub mod fs;
/// A virtual memory-based device.
pub mod memory;

/// A positioned byte device.
///
/// All offsets are absolute. Reads must fill the entire buffer, and writes
/// must persist the entire buffer, before returning success.
pub trait Device: Debug + Send + Sync + 'static {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error>;

    /// Writes all of `buf` starting at `offset`.
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error>;

    /// Resizes the device to `new_length` bytes, zero-filling any added
    /// space.
    fn resize(&mut self, new_length: u64) -> Result<(), Error>;

    /// Returns the current length of the device.
    fn length(&self) -> Result<u64, Error>;

    /// A durability barrier: blocks until every previously written byte has
    /// reached stable storage.
    fn synchronize(&mut self) -> Result<(), Error>;
}

/// Fixed big-endian integer helpers layered over any [`Device`].
pub trait DeviceExt: Device {
    /// Reads a big-endian `u32` at `offset`.
    fn read_u32_at(&self, offset: u64) -> Result<u32, Error> {
        let mut buf = [0; 4];
        self.read_exact_at(&mut buf, offset)?;
        Ok(BigEndian::read_u32(&buf))
    }

    /// Reads a big-endian `u64` at `offset`.
    fn read_u64_at(&self, offset: u64) -> Result<u64, Error> {
        let mut buf = [0; 8];
        self.read_exact_at(&mut buf, offset)?;
        Ok(BigEndian::read_u64(&buf))
    }

    /// Writes `value` as a big-endian `u32` at `offset`.
    fn write_u32_at(&mut self, value: u32, offset: u64) -> Result<(), Error> {
        let mut buf = [0; 4];
        BigEndian::write_u32(&mut buf, value);
        self.write_all_at(&buf, offset)
    }

    /// Writes `value` as a big-endian `u64` at `offset`.
    fn write_u64_at(&mut self, value: u64, offset: u64) -> Result<(), Error> {
        let mut buf = [0; 8];
        BigEndian::write_u64(&mut buf, value);
        self.write_all_at(&buf, offset)
    }
}

impl<D: Device + ?Sized> DeviceExt for D {}

/// A device borrowed for a single engine operation, paired with the
/// session's write-barrier policy. Every barrier the engine issues funnels
/// through [`Fence::barrier`] so the `USE_WRITE_BARRIER` flag is honoured in
/// one place.
pub(crate) struct Fence<'a> {
    device: &'a mut (dyn Device + 'static),
    barriers: bool,
}

impl<'a> Fence<'a> {
    pub fn new(device: &'a mut (dyn Device + 'static), barriers: bool) -> Self {
        Self { device, barriers }
    }

    /// Issues a durability barrier, unless barriers are disabled for the
    /// session.
    pub fn barrier(&mut self) -> Result<(), Error> {
        if self.barriers {
            self.device.synchronize()?;
        }
        Ok(())
    }
}

impl Deref for Fence<'_> {
    type Target = dyn Device;

    fn deref(&self) -> &Self::Target {
        &*self.device
    }
}

impl DerefMut for Fence<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.device
    }
}
