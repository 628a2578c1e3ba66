//! Storage types.
//!
//! This crate is the L0 flash abstraction consumed by both the boot loader
//! and the secure storage engine: erase-block aligned read/write/erase on a
//! small number of named areas, nothing more.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    NotAligned,
    OutOfBounds,
    NotWritten,
    NotErased,
    /// The underlying driver reported a failure that isn't one of the above
    /// (bus fault, ECC error, timeout from the controller, ...).
    Io,
}

pub type Result<T> = core::result::Result<T, Error>;

/// The logical flash regions named by the specification. Each area is still
/// a distinct `Flash` handle passed around directly by its consumer (boot,
/// sse); this is just the identity tag used in diagnostics and in the boot
/// handoff record, not a lookup registry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AreaId {
    Bl,
    Primary,
    Secondary,
    Scratch,
    SseArea,
    NvCounters,
}

/// Read only interface into flash.
pub trait ReadFlash {
    /// What is the read size (alignment and size multiple).
    fn read_size(&self) -> usize;
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()>;
    fn capacity(&self) -> usize;
    /// The byte value flash reads back as after an erase (commonly `0xff`).
    fn erased_value(&self) -> u8 {
        0xff
    }
    /// Opaque identifier for the underlying device, used only for
    /// diagnostics/handoff records.
    fn device_id(&self) -> u32 {
        0
    }
}

/// Flash that can be written to.
pub trait Flash: ReadFlash {
    /// Write size (alignment and size multiple).
    fn write_size(&self) -> usize;
    /// Erase size (alignment and size multiple).
    fn erase_size(&self) -> usize;

    fn erase(&mut self, from: usize, to: usize) -> Result<()>;
    /// Write `bytes` at `offset`. Only valid over erased bytes; callers must
    /// pad with `erased_value()` rather than rely on read-modify-write.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;
    /// Address of byte 0 of this area in the device's physical address
    /// space, used when chaining into an image or computing a RAM-load
    /// source window.
    fn base_address(&self) -> u64 {
        0
    }
}

// Utilities taken from embedded-storage for validating arguments.
pub fn check_read<T: ReadFlash>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_slice(flash, flash.read_size(), offset, length)
}

pub fn check_erase<T: Flash>(
    flash: &T,
    from: usize,
    to: usize,
) -> Result<()> {
    if from > to || to > flash.capacity() {
        return Err(Error::OutOfBounds);
    }
    if from % flash.erase_size() != 0 || to % flash.erase_size() != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

pub fn check_write<T: Flash>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_slice(flash, flash.write_size(), offset, length)
}

pub fn check_slice<T: ReadFlash>(
    flash: &T,
    align: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    if length > flash.capacity() || offset > flash.capacity() - length {
        return Err(Error::OutOfBounds);
    }
    if offset % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}
