use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use super::Device;
use crate::error::Error;

/// A fake "file" represented by an in-memory buffer. This should only be
/// used in testing, as this database format is not optimized for memory
/// efficiency.
///
/// Buffers are registered globally by path: opening the same path twice
/// yields handles over the same bytes, which lets tests close a tree and
/// reopen it the way they would with a real file.
#[derive(Debug)]
pub struct MemoryDevice {
    buffer: Arc<RwLock<Vec<u8>>>,
}

type OpenBuffers = Mutex<HashMap<PathBuf, Arc<RwLock<Vec<u8>>>>>;
static OPEN_BUFFERS: Lazy<OpenBuffers> = Lazy::new(Mutex::default);

impl MemoryDevice {
    /// Opens the buffer registered at `path`, creating an empty one if the
    /// path has not been opened before.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let mut open_buffers = OPEN_BUFFERS.lock();
        let buffer = open_buffers
            .entry(path.as_ref().to_path_buf())
            .or_default()
            .clone();
        Self { buffer }
    }

    /// Registers a buffer at `path` containing a copy of `contents`,
    /// replacing whatever was registered there. Useful for replaying a
    /// [`snapshot`](Self::snapshot) when testing crash recovery.
    pub fn restore(path: impl AsRef<Path>, contents: &[u8]) -> Self {
        let buffer = Arc::new(RwLock::new(contents.to_vec()));
        let mut open_buffers = OPEN_BUFFERS.lock();
        open_buffers.insert(path.as_ref().to_path_buf(), buffer.clone());
        Self { buffer }
    }

    /// Removes the buffer registered at `path`. Existing handles keep their
    /// bytes; future opens see an empty device.
    pub fn delete(path: impl AsRef<Path>) -> bool {
        let mut open_buffers = OPEN_BUFFERS.lock();
        open_buffers.remove(path.as_ref()).is_some()
    }

    /// Returns a copy of the device's current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.read().clone()
    }
}

impl Device for MemoryDevice {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        let buffer = self.buffer.read();
        let start = usize::try_from(offset).map_err(|_| Error::from("offset out of range"))?;
        let end = start + buf.len();
        if end > buffer.len() {
            return Err(Error::from(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read requested more bytes than available",
            )));
        }

        buf.copy_from_slice(&buffer[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error> {
        let mut buffer = self.buffer.write();
        let start = usize::try_from(offset).map_err(|_| Error::from("offset out of range"))?;
        let end = start + buf.len();
        if end > buffer.len() {
            buffer.resize(end, 0);
        }

        buffer[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn resize(&mut self, new_length: u64) -> Result<(), Error> {
        let mut buffer = self.buffer.write();
        let new_length =
            usize::try_from(new_length).map_err(|_| Error::from("length out of range"))?;
        buffer.resize(new_length, 0);
        Ok(())
    }

    fn length(&self) -> Result<u64, Error> {
        let buffer = self.buffer.read();
        Ok(buffer.len() as u64)
    }

    fn synchronize(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
