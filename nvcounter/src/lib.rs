//! Anti-rollback monotonic counters (§3.4, §4.6, §6.3).
//!
//! One counter per image security-counter index, stored in the
//! `NvCounters` area. Reads never decrease; a write only succeeds if the
//! requested value is greater than or equal to the value already stored.
//! `u32::MAX` is a terminal "at max" state (the boot loader rejects the
//! image rather than wrap around).
//!
//! Modeled on the read-whole-sector / modify / erase / rewrite pattern of
//! a dummy NV-counter backend: there is no in-die MTP/OTP counter available
//! to the simulator, so the whole counter sector is re-written on every
//! update, exactly as such a backend must on NOR flash that can only erase a
//! full sector at a time.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use storage::Flash;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    Flash,
    /// The counter has reached `u32::MAX`; no further increments are
    /// possible and the image relying on it must be rejected.
    AtMax,
    /// `update` was asked to move the counter backwards.
    WouldDecrease,
    BadId,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Identifies one counter within the NV counters area; corresponds to an
/// image's `security-counter index` (§3.2).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CounterId(pub u32);

pub trait CounterStore {
    fn read(&mut self, id: CounterId) -> Result<u32>;
    fn increment(&mut self, id: CounterId) -> Result<()>;
    /// Succeeds only if `value >= read(id)`; otherwise `WouldDecrease`.
    fn update(&mut self, id: CounterId, value: u32) -> Result<()>;
}

const COUNTER_SIZE: usize = core::mem::size_of::<u32>();
const MAX_COUNTERS: usize = 64;

/// Backs a fixed number of counters by one flash area, following the
/// "read the whole sector, modify in RAM, erase, rewrite" pattern common to
/// dummy NV-counter backends on NOR flash with no dedicated MTP counters.
pub struct FlashCounterStore<F: Flash> {
    flash: F,
    capacity: usize,
}

impl<F: Flash> FlashCounterStore<F> {
    pub fn new(flash: F) -> Self {
        let capacity = flash.capacity() / COUNTER_SIZE;
        FlashCounterStore { flash, capacity }
    }

    fn offset(&self, id: CounterId) -> Result<usize> {
        let idx = id.0 as usize;
        if idx >= self.capacity {
            return Err(Error::BadId);
        }
        Ok(idx * COUNTER_SIZE)
    }

    /// Counters are stored inverted (`!value`, little-endian) so that a
    /// never-written, freshly erased slot (`0xff` bytes) decodes as `0`
    /// rather than colliding with the bit pattern `u32::MAX` would otherwise
    /// produce on raw flash.
    fn read_raw(&mut self, id: CounterId) -> Result<u32> {
        let off = self.offset(id)?;
        let mut buf = [0u8; COUNTER_SIZE];
        self.flash.read(off, &mut buf).map_err(|_| Error::Flash)?;
        Ok(!u32::from_le_bytes(buf))
    }

    /// Rewrite every counter's current value, except `id` which takes
    /// `new_value`. The whole sector must be erased first since flash can
    /// only clear bits on erase, never set them back to `0xff`.
    fn rewrite_all(&mut self, id: CounterId, new_value: u32) -> Result<()> {
        let count = self.capacity.min(MAX_COUNTERS);
        let mut saved = heapless::Vec::<u32, MAX_COUNTERS>::new();
        for i in 0..count {
            let cid = CounterId(i as u32);
            let v = if cid == id { new_value } else { self.read_raw(cid)? };
            saved.push(v).map_err(|_| Error::Flash)?;
        }

        self.flash
            .erase(0, self.flash.capacity())
            .map_err(|_| Error::Flash)?;

        for (i, v) in saved.iter().enumerate() {
            let off = i * COUNTER_SIZE;
            self.flash
                .write(off, &(!v).to_le_bytes())
                .map_err(|_| Error::Flash)?;
        }
        Ok(())
    }
}

impl<F: Flash> CounterStore for FlashCounterStore<F> {
    fn read(&mut self, id: CounterId) -> Result<u32> {
        self.read_raw(id)
    }

    fn increment(&mut self, id: CounterId) -> Result<()> {
        let current = self.read_raw(id)?;
        if current == u32::MAX {
            return Err(Error::AtMax);
        }
        self.rewrite_all(id, current + 1)
    }

    fn update(&mut self, id: CounterId, value: u32) -> Result<()> {
        let current = self.read_raw(id)?;
        if current == u32::MAX {
            return Err(Error::AtMax);
        }
        if value < current {
            return Err(Error::WouldDecrease);
        }
        if value == current {
            // Idempotent: repeating the same update is a no-op success.
            return Ok(());
        }
        self.rewrite_all(id, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simflash_stub::StubFlash;

    // A minimal in-crate flash stub so nvcounter's unit tests don't need to
    // depend on the workspace's std-only simflash crate.
    mod simflash_stub {
        use storage::{Error, Flash, ReadFlash, Result};

        pub struct StubFlash {
            data: [u8; 256],
        }

        impl StubFlash {
            pub fn new() -> Self {
                StubFlash { data: [0xff; 256] }
            }
        }

        impl ReadFlash for StubFlash {
            fn read_size(&self) -> usize {
                1
            }
            fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()> {
                if offset + bytes.len() > self.data.len() {
                    return Err(Error::OutOfBounds);
                }
                bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
                Ok(())
            }
            fn capacity(&self) -> usize {
                self.data.len()
            }
        }

        impl Flash for StubFlash {
            fn write_size(&self) -> usize {
                1
            }
            fn erase_size(&self) -> usize {
                self.data.len()
            }
            fn erase(&mut self, from: usize, to: usize) -> Result<()> {
                self.data[from..to].fill(0xff);
                Ok(())
            }
            fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
                if offset + bytes.len() > self.data.len() {
                    return Err(Error::OutOfBounds);
                }
                self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
        }
    }

    #[test]
    fn monotone_reads() {
        let mut store = FlashCounterStore::new(StubFlash::new());
        let id = CounterId(2);
        assert_eq!(store.read(id).unwrap(), 0);
        store.increment(id).unwrap();
        store.increment(id).unwrap();
        assert_eq!(store.read(id).unwrap(), 2);
        store.update(id, 5).unwrap();
        assert_eq!(store.read(id).unwrap(), 5);
    }

    #[test]
    fn rejects_decrease() {
        let mut store = FlashCounterStore::new(StubFlash::new());
        let id = CounterId(0);
        store.update(id, 5).unwrap();
        assert_eq!(store.update(id, 3), Err(Error::WouldDecrease));
    }

    #[test]
    fn idempotent_same_value() {
        let mut store = FlashCounterStore::new(StubFlash::new());
        let id = CounterId(0);
        store.update(id, 5).unwrap();
        store.update(id, 5).unwrap();
        assert_eq!(store.read(id).unwrap(), 5);
    }

    #[test]
    fn other_counters_unaffected() {
        let mut store = FlashCounterStore::new(StubFlash::new());
        store.update(CounterId(0), 9).unwrap();
        store.update(CounterId(1), 3).unwrap();
        assert_eq!(store.read(CounterId(0)).unwrap(), 9);
        assert_eq!(store.read(CounterId(1)).unwrap(), 3);
    }
}
