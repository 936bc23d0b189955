use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

#[cfg(windows)]
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

use super::Device;
use crate::error::Error;

/// A byte device backed by [`std::fs`].
#[derive(Debug)]
pub struct StdDevice {
    file: File,
    path: PathBuf,
}

impl StdDevice {
    /// Opens an existing file at `path` with read and write permission.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        Ok(Self {
            file: OpenOptions::new().read(true).write(true).open(path)?,
            path: path.to_path_buf(),
        })
    }

    /// Opens the file at `path`, creating it empty if it does not exist.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        Ok(Self {
            file: OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
            path: path.to_path_buf(),
        })
    }

    /// Returns the path this device was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Device for StdDevice {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, buf)))]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        #[cfg(unix)]
        {
            self.file.read_exact_at(buf, offset).map_err(Error::from)
        }
        #[cfg(windows)]
        {
            let mut buf = buf;
            let mut offset = offset;
            while !buf.is_empty() {
                let read = self.file.seek_read(buf, offset)?;
                if read == 0 {
                    return Err(Error::from(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    )));
                }
                buf = &mut buf[read..];
                offset += read as u64;
            }
            Ok(())
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, buf)))]
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error> {
        #[cfg(unix)]
        {
            self.file.write_all_at(buf, offset).map_err(Error::from)
        }
        #[cfg(windows)]
        {
            let mut buf = buf;
            let mut offset = offset;
            while !buf.is_empty() {
                let written = self.file.seek_write(buf, offset)?;
                if written == 0 {
                    return Err(Error::from(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    )));
                }
                buf = &buf[written..];
                offset += written as u64;
            }
            Ok(())
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    fn resize(&mut self, new_length: u64) -> Result<(), Error> {
        self.file.set_len(new_length).map_err(Error::from)
    }

    fn length(&self) -> Result<u64, Error> {
        let metadata = self.file.metadata()?;
        Ok(metadata.len())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    fn synchronize(&mut self) -> Result<(), Error> {
        self.file.sync_all().map_err(Error::from)
    }
}
