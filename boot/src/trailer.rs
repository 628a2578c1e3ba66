//! Image trailer layout and codec (§3.2 trailer, §6.4).
//!
//! Generalizes the geometry math of the original status-layout code (kept:
//! `SlotInfo`, the alignment-rounding technique of working backward from the
//! end of the area) to the scratch-swap trailer the specification actually
//! prescribes: `magic | image_ok | copy_done | swap_size | status_log`,
//! from the end of the slot toward lower addresses, each single-byte field
//! occupying one write-alignment unit.

use storage::Flash;

use crate::{Error, Result};

/// Information needed to calculate trailer layout.
#[derive(Debug)]
pub struct SlotInfo {
    /// Device write size.
    pub write_size: usize,
    /// Device erase size.
    pub erase_size: usize,
    /// Size of the full flash slot.
    pub capacity: usize,
}

impl SlotInfo {
    pub fn from_flash<F: Flash>(flash: &F) -> SlotInfo {
        SlotInfo {
            write_size: flash.write_size(),
            erase_size: flash.erase_size(),
            capacity: flash.capacity(),
        }
    }

    pub fn num_sectors(&self) -> usize {
        self.capacity / self.erase_size
    }
}

pub const MAGIC_SIZE: usize = 16;
/// Number of distinct per-sector states the status log records (§4.2: 0, 1, 2).
pub const STATE_COUNT: usize = 3;

/// The 16-byte magic value written last on a successful trailer commit.
pub const MAGIC_GOOD: [u8; MAGIC_SIZE] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79, 0x80,
];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Magic {
    Good,
    Unset,
    Bad,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Flag {
    Set,
    Unset,
    /// Used only when matching against the status-source table, where the
    /// value doesn't matter.
    Any,
}

/// Describes where each trailer field lives, worked out from the end of the
/// area backward, each field rounded down to its own alignment boundary the
/// same way the original geometry code does.
#[derive(Debug)]
pub struct TrailerLayout {
    pub align: usize,
    pub erase_size: usize,
    pub num_sectors: usize,
    pub magic_off: usize,
    pub image_ok_off: usize,
    pub copy_done_off: usize,
    pub swap_size_off: usize,
    pub status_log_off: usize,
}

impl TrailerLayout {
    /// Lay out the trailer within the *last sector* of a slot/scratch area.
    pub fn new(slot: &SlotInfo) -> Result<TrailerLayout> {
        if slot.erase_size == 0 || slot.write_size == 0 {
            return Err(Error::NotUpgradeable);
        }
        // The scratch-swap trailer needs per-field writes much smaller than
        // the erase size; devices whose write granularity is comparable to
        // the erase size (the "paged" style) aren't upgradeable under this
        // algorithm and must use the overwrite-only or RAM-load variants.
        if slot.write_size > 32 {
            return Err(Error::NotUpgradeable);
        }
        let align = slot.write_size;
        let last_sector = slot.num_sectors().saturating_sub(1) * slot.erase_size;
        let sector_end = last_sector + slot.erase_size;

        let mut pos = sector_end;
        pos -= MAGIC_SIZE;
        let magic_off = pos;

        pos = round_down(pos, align);
        pos -= align;
        let image_ok_off = pos;

        pos -= align;
        let copy_done_off = pos;

        let swap_size_bytes = round_up(4, align);
        pos -= swap_size_bytes;
        let swap_size_off = pos;

        let log_bytes = round_up(STATE_COUNT * slot.num_sectors(), align);
        pos = pos.checked_sub(log_bytes).ok_or(Error::NotUpgradeable)?;
        let status_log_off = pos;

        if status_log_off < last_sector {
            return Err(Error::NotUpgradeable);
        }

        Ok(TrailerLayout {
            align,
            erase_size: slot.erase_size,
            num_sectors: slot.num_sectors(),
            magic_off,
            image_ok_off,
            copy_done_off,
            swap_size_off,
            status_log_off,
        })
    }

    pub fn read_magic<F: Flash>(&self, flash: &mut F) -> Result<Magic> {
        let mut buf = [0u8; MAGIC_SIZE];
        flash
            .read(self.magic_off, &mut buf)
            .map_err(|_| Error::Flash)?;
        if buf == MAGIC_GOOD {
            Ok(Magic::Good)
        } else if buf.iter().all(|&b| b == flash.erased_value()) {
            Ok(Magic::Unset)
        } else {
            Ok(Magic::Bad)
        }
    }

    pub fn write_magic<F: Flash>(&self, flash: &mut F) -> Result<()> {
        flash
            .write(self.magic_off, &MAGIC_GOOD)
            .map_err(|_| Error::Flash)
    }

    fn read_flag<F: Flash>(&self, flash: &mut F, off: usize) -> Result<Flag> {
        let mut buf = [0u8; 1];
        flash.read(off, &mut buf).map_err(|_| Error::Flash)?;
        if buf[0] == flash.erased_value() {
            Ok(Flag::Unset)
        } else {
            Ok(Flag::Set)
        }
    }

    fn write_flag<F: Flash>(&self, flash: &mut F, off: usize) -> Result<()> {
        let mut buf = heapless::Vec::<u8, 32>::new();
        buf.resize(self.align, 1u8).map_err(|_| Error::BadImage)?;
        flash.write(off, &buf).map_err(|_| Error::Flash)
    }

    pub fn read_image_ok<F: Flash>(&self, flash: &mut F) -> Result<Flag> {
        self.read_flag(flash, self.image_ok_off)
    }

    pub fn write_image_ok<F: Flash>(&self, flash: &mut F) -> Result<()> {
        self.write_flag(flash, self.image_ok_off)
    }

    pub fn read_copy_done<F: Flash>(&self, flash: &mut F) -> Result<Flag> {
        self.read_flag(flash, self.copy_done_off)
    }

    pub fn write_copy_done<F: Flash>(&self, flash: &mut F) -> Result<()> {
        self.write_flag(flash, self.copy_done_off)
    }

    pub fn read_swap_size<F: Flash>(&self, flash: &mut F) -> Result<u32> {
        let mut buf = [0u8; 4];
        flash
            .read(self.swap_size_off, &mut buf)
            .map_err(|_| Error::Flash)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_swap_size<F: Flash>(&self, flash: &mut F, size: u32) -> Result<()> {
        let mut buf = heapless::Vec::<u8, 32>::new();
        buf.resize(self.align, 0u8).map_err(|_| Error::BadImage)?;
        buf[..4].copy_from_slice(&size.to_le_bytes());
        flash
            .write(self.swap_size_off, &buf)
            .map_err(|_| Error::Flash)
    }

    /// Write one status-log byte at the slot `idx` (reverse sector order,
    /// last sector first) for `state` (0, 1, or 2) — §4.2's "three-state-per
    /// -sector progress log".
    pub fn write_status<F: Flash>(&self, flash: &mut F, idx: usize, state: usize) -> Result<()> {
        let off = self.status_log_off + (idx * STATE_COUNT + state) * self.align;
        let mut buf = heapless::Vec::<u8, 32>::new();
        buf.resize(self.align, 1u8).map_err(|_| Error::BadImage)?;
        flash.write(off, &buf).map_err(|_| Error::Flash)
    }

    /// Scan the status log and return the furthest-advanced `(idx, state)`,
    /// i.e. the first written byte when scanning from the start of the log
    /// (index `num_sectors-1`, state 0) forward. Returns `None` if nothing
    /// has been written (no swap in progress).
    pub fn read_status<F: Flash>(&self, flash: &mut F) -> Result<Option<(usize, usize)>> {
        let mut best: Option<(usize, usize)> = None;
        for idx in 0..self.num_sectors {
            for state in 0..STATE_COUNT {
                let off = self.status_log_off + (idx * STATE_COUNT + state) * self.align;
                let mut buf = [0u8; 1];
                flash.read(off, &mut buf).map_err(|_| Error::Flash)?;
                if buf[0] != flash.erased_value() {
                    best = Some((idx, state));
                }
            }
        }
        Ok(best)
    }
}

fn round_down(v: usize, align: usize) -> usize {
    v & !(align - 1)
}

fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Where to resume an interrupted swap from (§4.2 status-source table).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatusSource {
    None,
    Primary,
    Scratch,
}

/// The normative four-row status-source table (§4.2): maps
/// `(primary.magic, scratch.magic, primary.copy_done)` to the area whose
/// status log should be resumed from.
pub fn status_source(primary_magic: Magic, scratch_magic: Magic, primary_copy_done: Flag) -> StatusSource {
    match (primary_magic, scratch_magic, primary_copy_done) {
        (Magic::Good, _, Flag::Set) => StatusSource::None,
        (Magic::Good, _, Flag::Unset) => StatusSource::Primary,
        (_, Magic::Good, _) => StatusSource::Scratch,
        (Magic::Unset, _, Flag::Unset) => StatusSource::Primary,
        _ => StatusSource::None,
    }
}
