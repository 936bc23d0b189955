use std::{
    io,
    ops::Deref,
    path::{Path, PathBuf},
};

use crate::{error::Error, io::Device};

/// A temporary directory that deletes itself, and anything created inside
/// it, when dropped.
pub struct TestDirectory(pub PathBuf);

impl TestDirectory {
    pub fn new<S: AsRef<Path>>(name: S) -> Self {
        let path = std::env::temp_dir().join(name);
        if path.exists() {
            std::fs::remove_dir_all(&path).expect("error clearing temporary directory");
        }
        Self(path)
    }
}

impl Drop for TestDirectory {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.0) {
            if err.kind() != io::ErrorKind::NotFound {
                eprintln!("Failed to clean up temporary folder: {err:?}");
            }
        }
    }
}

impl AsRef<Path> for TestDirectory {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Deref for TestDirectory {
    type Target = PathBuf;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A device that simulates a crash mid-operation.
///
/// The first `fuse` writes (including resizes) reach the inner device.
/// Every later write is silently dropped, modelling bytes that never made
/// it to the platter, and the next durability barrier fails, modelling the
/// process dying. Reads keep working so the torn state can be inspected.
#[derive(Debug)]
pub struct CrashDevice<D: Device> {
    inner: D,
    fuse: u64,
    writes: u64,
    crashed: bool,
}

impl<D: Device> CrashDevice<D> {
    pub fn new(inner: D, fuse: u64) -> Self {
        Self {
            inner,
            fuse,
            writes: 0,
            crashed: false,
        }
    }

    /// Number of writes attempted so far, dropped ones included. Running an
    /// operation with an unlimited fuse and reading this back gives the
    /// range of interesting crash points.
    pub fn writes(&self) -> u64 {
        self.writes
    }
}

impl<D: Device> Device for CrashDevice<D> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        self.inner.read_exact_at(buf, offset)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error> {
        self.writes += 1;
        if self.writes > self.fuse {
            self.crashed = true;
            return Ok(());
        }
        self.inner.write_all_at(buf, offset)
    }

    fn resize(&mut self, new_length: u64) -> Result<(), Error> {
        self.writes += 1;
        if self.writes > self.fuse {
            self.crashed = true;
            return Ok(());
        }
        self.inner.resize(new_length)
    }

    fn length(&self) -> Result<u64, Error> {
        self.inner.length()
    }

    fn synchronize(&mut self) -> Result<(), Error> {
        if self.crashed {
            return Err(Error::from(io::Error::new(
                io::ErrorKind::Interrupted,
                "simulated crash",
            )));
        }
        self.inner.synchronize()
    }
}
