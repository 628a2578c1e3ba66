//! Secure Storage Engine (§4): a flash-resident, power-failure-safe,
//! per-object-AEAD key-value store, built the same way the boot loader
//! builds its own image swap — an alternating active/scratch pair of
//! physical blocks, the newer one elected by an authenticated swap
//! counter, every mutation applied by writing a whole new block before the
//! old one is reclaimed.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

mod block;
mod codec;
mod error;
mod layout;
mod table;
mod util;

pub use error::{Error, Result};
pub use layout::{MAX_OBJECTS, MAX_OBJECT_SIZE, TABLE_FILE_ID};
pub use table::{ObjectInfo, ObjectTable};
