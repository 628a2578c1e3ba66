//! Simulated flash
//!
//! The NOR-type flashes used in microcontrollers differ quite a bit in terms
//! of capabilities provided. This simulator attempts to capture the
//! diversity of these devices through [`styles`] while only ever speaking
//! the workspace's own [`storage::Flash`] trait (no `embedded-storage`
//! traits here; see `DESIGN.md` for why).
//!
//! The NorFlash-style device defines a read size, an erase size, and a write
//! size. We require that the erase size be a multiple of the write size
//! (they can be the same). At this point in time the read size is always 1.
//! There are a couple of different families of devices that are common:
//!
//! - Old style: erase size is 4k-128k, write size is typically 1-8, sometimes
//!   as much as 16 or 32, although these might need to be considered a
//!   different class of device.
//! - Large write: erase size is 128k, write size is 32. Large to write, but
//!   also large erase sizes.
//! - Paged: erase size is 512, write size is 512. The write size is much
//!   larger than the others, but the smaller erases allow us to treat the
//!   device more like blocks.

pub mod gen;
pub mod styles;

use storage::{check_erase, check_read, check_write, Flash, ReadFlash};

/// A complete, in-memory `Flash` implementation backed by a plain byte
/// vector, used by every unit and integration test in the workspace.
pub struct SimFlash {
    data: Vec<u8>,
    read_size: usize,
    write_size: usize,
    erase_size: usize,
    /// Fault injection: if set, the Nth subsequent `write` call returns
    /// `Error::Io` instead of completing, simulating a power loss mid-write
    /// (used by the swap/SSE atomicity seed tests).
    fail_after: Option<usize>,
    write_count: usize,
}

impl SimFlash {
    pub fn new(
        read_size: usize,
        write_size: usize,
        erase_size: usize,
        sectors: usize,
    ) -> anyhow::Result<SimFlash> {
        if erase_size % write_size != 0 {
            return Err(anyhow::anyhow!(
                "erase size {} is not a multiple of write size {}",
                erase_size,
                write_size
            ));
        }
        let capacity = erase_size * sectors;
        Ok(SimFlash {
            data: vec![0xffu8; capacity],
            read_size,
            write_size,
            erase_size,
            fail_after: None,
            write_count: 0,
        })
    }

    /// Install raw image data at `offset`, bypassing the program-only-clears-
    /// bits rule below. Used by tests to seed a slot's initial contents
    /// without simulating the erase/write cycle.
    pub fn install(&mut self, data: &[u8], offset: usize) -> anyhow::Result<()> {
        if offset + data.len() > self.data.len() {
            return Err(anyhow::anyhow!("install out of bounds"));
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Arrange for the `n`th call to `write` (1-indexed, counting from now)
    /// to fail partway through, simulating a power cut. The write still
    /// partially lands (first half of the buffer), matching the
    /// torn-write behavior real NOR flash exhibits under brownout.
    pub fn fail_after_n_writes(&mut self, n: usize) {
        self.fail_after = Some(n);
        self.write_count = 0;
    }
}

impl ReadFlash for SimFlash {
    fn read_size(&self) -> usize {
        self.read_size
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        check_read(self, offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Flash for SimFlash {
    fn write_size(&self) -> usize {
        self.write_size
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }

    fn erase(&mut self, from: usize, to: usize) -> storage::Result<()> {
        check_erase(self, from, to)?;
        self.data[from..to].fill(0xff);
        Ok(())
    }

    /// NOR flash can only clear bits on a program operation, never set them
    /// back to `1` without a fresh erase; modeled here as a bitwise AND of
    /// the requested bytes into whatever is already stored, which both
    /// rejects attempts to set an already-cleared bit and lets a sector be
    /// programmed in more than one pass (e.g. a bulk sector copy followed by
    /// a narrower overlay write into the same erased block) as long as every
    /// pass only clears further bits.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        check_write(self, offset, bytes.len())?;
        for (i, &b) in bytes.iter().enumerate() {
            if self.data[offset + i] & b != b {
                return Err(storage::Error::NotErased);
            }
        }

        if let Some(limit) = self.fail_after {
            self.write_count += 1;
            if self.write_count >= limit {
                let half = bytes.len() / 2;
                for (i, &b) in bytes[..half].iter().enumerate() {
                    self.data[offset + i] &= b;
                }
                return Err(storage::Error::Io);
            }
        }

        for (i, &b) in bytes.iter().enumerate() {
            self.data[offset + i] &= b;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_only_clears_bits_and_needs_erase_to_set_them_back() {
        let mut flash = SimFlash::new(1, 8, 4096, 2).unwrap();
        flash.erase(0, 4096).unwrap();
        flash.write(0, &[0b1010_1010u8; 8]).unwrap();

        // Trying to set a bit that's already been cleared requires an erase.
        assert!(flash.write(0, &[0xffu8; 8]).is_err());

        // Clearing further bits within the same erased block still works.
        flash.write(0, &[0b0000_1010u8; 8]).unwrap();
        let mut out = [0u8; 8];
        flash.read(0, &mut out).unwrap();
        assert_eq!(out, [0b0000_1010u8; 8]);

        flash.erase(0, 4096).unwrap();
        flash.write(0, &[1u8; 8]).unwrap();
        flash.read(0, &mut out).unwrap();
        assert_eq!(out, [1u8; 8]);
    }

    #[test]
    fn fault_injection_tears_the_write() {
        let mut flash = SimFlash::new(1, 8, 4096, 2).unwrap();
        flash.erase(0, 4096).unwrap();
        flash.fail_after_n_writes(1);
        assert!(flash.write(0, &[9u8; 8]).is_err());
        let mut out = [0u8; 8];
        flash.read(0, &mut out).unwrap();
        assert_eq!(&out[..4], &[9u8; 4]);
        assert_eq!(&out[4..], &[0xffu8; 4]);
    }
}
