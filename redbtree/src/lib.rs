//! Single-file durable B-Tree storage keyed by fixed 16-byte hashed keys.
//!
//! A [`BTree`] maps 16-byte keys to variable-length value blobs inside one
//! file. Durability comes from copy-on-write publication: existing on-disk
//! nodes are never modified in place. Every mutation writes replacement
//! nodes into freshly allocated space, flushes them, and only then
//! overwrites the single 8-byte pointer that makes them reachable. Replaced
//! nodes are recycled through a power-of-two free-list allocator that
//! manages the space inside the file.
//!
//! ```no_run
//! use redbtree::{io::fs::StdDevice, BTree, Flags};
//!
//! # fn main() -> Result<(), redbtree::Error> {
//! let device = StdDevice::open_or_create("example.redb")?;
//! let mut tree = BTree::open(device, Flags::CREATE)?;
//!
//! let key = *b"0123456789abcdef";
//! tree.add(&key, b"a value", false)?;
//! let offset = tree.find(&key)?;
//! assert_eq!(tree.read_value(offset)?, b"a value");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::cargo,
    missing_docs,
    clippy::nursery,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms
)]
#![cfg_attr(doc, deny(rustdoc::all))]
#![allow(
    clippy::missing_errors_doc,
    clippy::option_if_let_else,
    clippy::module_name_repetitions
)]

pub mod io;

mod allocator;
mod cache;
mod error;
mod format;
mod node;
#[cfg(test)]
mod test_util;
mod tree;

pub use self::{
    cache::NodeCache,
    error::{Error, ErrorKind},
    format::{FREELIST_BLOCK_ITEMS, FREELIST_COUNT, KEY_LEN, MAGIC, MAX_KEYS, NODE_SIZE},
    tree::{BTree, Flags},
};
