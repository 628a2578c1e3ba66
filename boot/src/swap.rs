//! Three-phase sector swap engine (§4.2) and the compact overwrite-only
//! variant.
//!
//! The scratch-swap algorithm moves the upgrade image from the secondary
//! slot into the primary slot one erase-sector at a time, using the scratch
//! area as working space so that a power loss at any point leaves enough
//! information in the trailer's status log to resume exactly where it left
//! off. Only the last (trailer-bearing) sector ever flows through the
//! `use_scratch` path; every other sector is a plain three-way shuffle.

use storage::Flash;

use crate::trailer::{SlotInfo, TrailerLayout};
use crate::{Error, Result};

/// One step of the three-phase per-sector swap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Secondary's sector copied into scratch.
S0 = 0,
    /// Primary's sector copied into secondary.
    S1 = 1,
    /// Scratch's sector copied into primary.
    S2 = 2,
}

impl State {
    fn from_usize(v: usize) -> Option<State> {
        match v {
            0 => Some(State::S0),
            1 => Some(State::S1),
            2 => Some(State::S2),
            _ => None,
        }
    }
}

/// Drives the scratch-based swap across three flash areas. `P`, `S`, `C` are
/// generic rather than forced to a common type since the primary, secondary,
/// and scratch areas are ordinarily independent `Flash` handles over the
/// same underlying device, sliced differently.
pub struct SwapEngine<'a, P: Flash, S: Flash, C: Flash> {
    primary: &'a mut P,
    secondary: &'a mut S,
    scratch: &'a mut C,
    primary_layout: TrailerLayout,
    scratch_layout: TrailerLayout,
    num_sectors: usize,
}

impl<'a, P: Flash, S: Flash, C: Flash> SwapEngine<'a, P, S, C> {
    pub fn new(primary: &'a mut P, secondary: &'a mut S, scratch: &'a mut C) -> Result<Self> {
        let primary_slot = SlotInfo::from_flash(primary);
        let secondary_slot = SlotInfo::from_flash(secondary);
        if primary_slot.erase_size != secondary_slot.erase_size
            || primary_slot.num_sectors() != secondary_slot.num_sectors()
        {
            return Err(Error::NotUpgradeable);
        }
        let primary_layout = TrailerLayout::new(&primary_slot)?;
        let scratch_slot = SlotInfo::from_flash(scratch);
        let scratch_layout = TrailerLayout::new(&scratch_slot)?;

        Ok(SwapEngine {
            num_sectors: primary_slot.num_sectors(),
            primary,
            secondary,
            scratch,
            primary_layout,
            scratch_layout,
        })
    }

    /// Is sector `idx` the one carrying the trailer (the last sector)?
    fn use_scratch(&self, idx: usize) -> bool {
        idx == self.num_sectors - 1
    }

    fn copy_sector(
        erase_size: usize,
        src: &mut impl Flash,
        src_off: usize,
        dst: &mut impl Flash,
        dst_off: usize,
    ) -> Result<()> {
        dst.erase(dst_off, dst_off + erase_size)
            .map_err(|_| Error::Flash)?;
        let mut buf = heapless::Vec::<u8, 4096>::new();
        buf.resize(erase_size, 0).map_err(|_| Error::BadImage)?;
        src.read(src_off, &mut buf).map_err(|_| Error::Flash)?;
        dst.write(dst_off, &buf).map_err(|_| Error::Flash)
    }

    /// Run the swap to completion, resuming from `(idx, state)` if given
    /// (the furthest-advanced entry read back from the status log).
    pub fn run(&mut self, resume: Option<(usize, usize)>) -> Result<()> {
        let erase_size = self.primary_layout.erase_size;
        let (start_idx, start_state) = match resume {
            Some((idx, state)) => (idx, State::from_usize(state).ok_or(Error::BadImage)? as usize + 1),
            None => (self.num_sectors, 0),
        };

        let mut idx = if resume.is_some() { start_idx } else { self.num_sectors - 1 };
        let mut first_state = if resume.is_some() { start_state } else { 0 };

        loop {
            let sector_off = idx * erase_size;
            // While the trailer sector itself is mid-swap, primary's own
            // trailer is either about to be erased (states 0-1) or has just
            // been freshly overwritten (state 2); the status log for this
            // sector lives in scratch's copy of the trailer until the whole
            // sector has made it back into primary. Every other sector's
            // progress is logged straight into primary, which isn't touched
            // by this loop iteration.
            let use_scratch = self.use_scratch(idx);

            if first_state <= 0 {
                Self::copy_sector(erase_size, self.secondary, sector_off, self.scratch, sector_off)?;
                if use_scratch {
                    self.scratch_layout.write_swap_size(self.scratch, erase_size as u32 * self.num_sectors as u32)?;
                    self.scratch_layout.write_magic(self.scratch)?;
                    self.scratch_layout.write_status(self.scratch, idx, State::S0 as usize)?;
                } else {
                    self.primary_layout.write_status(self.primary, idx, State::S0 as usize)?;
                }
            }

            if first_state <= 1 {
                Self::copy_sector(erase_size, self.primary, sector_off, self.secondary, sector_off)?;
                if use_scratch {
                    self.scratch_layout.write_status(self.scratch, idx, State::S1 as usize)?;
                } else {
                    self.primary_layout.write_status(self.primary, idx, State::S1 as usize)?;
                }
            }

            if first_state <= 2 {
                Self::copy_sector(erase_size, self.scratch, sector_off, self.primary, sector_off)?;
                if use_scratch {
                    let swap_size = self.scratch_layout.read_swap_size(self.scratch)?;
                    self.primary_layout.write_swap_size(self.primary, swap_size)?;
                    // Past this write, neither primary nor scratch still
                    // holds a trailer the other slot could be reconstructed
                    // from; a failure here is unrecoverable (§4.1/§7 PANIC),
                    // not an ordinary flash error.
                    if self.primary_layout.write_magic(self.primary).is_err() {
                        #[cfg(not(test))]
                        halt_forever();
                        return Err(Error::Panic);
                    }
                    self.scratch_layout.write_status(self.scratch, idx, State::S2 as usize)?;
                } else {
                    self.primary_layout.write_status(self.primary, idx, State::S2 as usize)?;
                }
            }

            first_state = 0;
            if idx == 0 {
                break;
            }
            idx -= 1;
        }

        self.primary_layout.write_copy_done(self.primary)?;
        Ok(())
    }
}

/// Spin forever; there is nowhere left to chain to once a trailer write has
/// failed past the point of no return. Kept out of the `#[cfg(test)]` build
/// so the error path stays observable in tests, mirroring
/// `controller::chain_to_image`'s own test/non-test divergence.
#[cfg(not(test))]
fn halt_forever() -> ! {
    loop {
        core::hint::spin_loop()
    }
}

/// Compact swap variant for devices/policies that forgo resumability: copy
/// the secondary slot over the primary slot wholesale, sector by sector, with
/// no trailer bookkeeping (§4.2 "compact overwrite-only variant"). A power
/// loss mid-copy leaves the primary slot corrupt; this variant is only
/// appropriate when `BootPolicy` pairs it with a separate recovery slot or
/// accepts the risk, per `SwapAlgorithm::OverwriteOnly`.
pub struct OverwriteEngine<'a, P: Flash, S: Flash> {
    primary: &'a mut P,
    secondary: &'a mut S,
}

impl<'a, P: Flash, S: Flash> OverwriteEngine<'a, P, S> {
    pub fn new(primary: &'a mut P, secondary: &'a mut S) -> Self {
        OverwriteEngine { primary, secondary }
    }

    pub fn run(&mut self) -> Result<()> {
        let erase_size = self.primary.erase_size();
        let capacity = self.primary.capacity().min(self.secondary.capacity());
        let mut off = 0;
        while off < capacity {
            self.primary
                .erase(off, off + erase_size)
                .map_err(|_| Error::Flash)?;
            let mut buf = heapless::Vec::<u8, 4096>::new();
            buf.resize(erase_size, 0).map_err(|_| Error::BadImage)?;
            self.secondary.read(off, &mut buf).map_err(|_| Error::Flash)?;
            self.primary.write(off, &buf).map_err(|_| Error::Flash)?;
            off += erase_size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simflash::styles;

    fn install_pattern(flash: &mut impl Flash, byte: u8) {
        let cap = flash.capacity();
        let buf = vec![byte; cap];
        flash.install(&buf, 0).unwrap();
    }

    #[test]
    fn swap_moves_secondary_into_primary() {
        let mut primary = styles::K64_MAIN.build().unwrap();
        let mut secondary = styles::K64_MAIN.build().unwrap();
        let mut scratch = styles::K64_MAIN.build().unwrap();

        install_pattern(&mut primary, 0xaa);
        install_pattern(&mut secondary, 0xbb);

        {
            let mut engine = SwapEngine::new(&mut primary, &mut secondary, &mut scratch).unwrap();
            engine.run(None).unwrap();
        }

        let mut buf = [0u8; 16];
        primary.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xbbu8; 16]);

        secondary.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xaau8; 16]);
    }

    #[test]
    fn resume_from_status_replays_remaining_states() {
        let mut primary = styles::K64_MAIN.build().unwrap();
        let mut secondary = styles::K64_MAIN.build().unwrap();
        let mut scratch = styles::K64_MAIN.build().unwrap();

        install_pattern(&mut primary, 0xaa);
        install_pattern(&mut secondary, 0xbb);

        let top = {
            let slot = SlotInfo::from_flash(&primary);
            slot.num_sectors() - 1
        };

        {
            let mut engine = SwapEngine::new(&mut primary, &mut secondary, &mut scratch).unwrap();
            // Simulate a crash after the very first sector's state-0 copy by
            // resuming from (top, 0): state 1 and 2 for that sector still run.
            engine.run(Some((top, 0))).unwrap();
        }

        let mut buf = [0u8; 16];
        primary.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xbbu8; 16]);
    }
}
