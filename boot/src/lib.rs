//! This is a basic bootloader built for embedded rust.
//!
//! It supports validating and authenticating images, swapping an update into
//! the primary slot with power-failure-safe resume, and chaining into the
//! selected image.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

mod controller;
mod handoff;
mod image;
mod policy;
mod ram_load;
mod swap;
mod trailer;

pub use controller::{BootController, BootResponse, Listener, NullListener};
pub use handoff::HandoffWriter;
pub use image::{flags, Image, ImageHeader, ImageVersion, TlvKind, ValidatePolicy, IMAGE_MAGIC};
pub use policy::{BootPolicy, SwapAlgorithm, SwapType};
pub use ram_load::{ram_copy, select_newest, SlotCandidate};
pub use swap::{OverwriteEngine, SwapEngine};
pub use trailer::{Flag, Magic, SlotInfo, StatusSource, TrailerLayout};

/// Errors surfaced to the boot controller and its callers (§7 subset
/// relevant to the boot loader).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// The underlying flash device reported a failure.
    Flash,
    /// An image header, TLV block, or digest failed to parse or match.
    BadImage,
    /// The device's write/erase geometry cannot support the scratch-swap
    /// trailer (paged-style devices; see `trailer::TrailerLayout::new`).
    NotUpgradeable,
    /// Signature verification failed.
    AuthFail,
    /// The candidate image's security counter is not ahead of the stored
    /// counter; refused per the anti-rollback policy.
    RollbackRefused,
    /// A flag write failed after the point of no return during a swap; the
    /// device must halt rather than boot either slot.
    Panic,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Error::Flash => "flash I/O error",
            Error::BadImage => "malformed or unauthenticated image",
            Error::NotUpgradeable => "device geometry does not support this swap algorithm",
            Error::AuthFail => "signature verification failed",
            Error::RollbackRefused => "security counter did not advance",
            Error::Panic => "swap left in an unrecoverable state; halting",
        };
        f.write_str(s)
    }
}

impl From<storage::Error> for Error {
    fn from(_: storage::Error) -> Error {
        Error::Flash
    }
}

impl From<crypto::Error> for Error {
    fn from(_: crypto::Error) -> Error {
        Error::AuthFail
    }
}

impl From<nvcounter::Error> for Error {
    fn from(e: nvcounter::Error) -> Error {
        match e {
            nvcounter::Error::WouldDecrease | nvcounter::Error::AtMax => Error::RollbackRefused,
            nvcounter::Error::BadId => Error::BadImage,
            nvcounter::Error::Flash => Error::Flash,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
