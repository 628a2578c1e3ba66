//! The boot controller ties the image codec, trailer, swap engine, and
//! anti-rollback counter together into the single entry point a reset
//! handler calls (§4.1 steps 1-8).

use crypto::Crypto;
use nvcounter::{CounterId, CounterStore};
use storage::Flash;

use crate::handoff::HandoffWriter;
use crate::image::{Image, ImageHeader, ValidatePolicy};
use crate::policy::{BootPolicy, SwapAlgorithm, SwapType};
use crate::ram_load::{ram_copy, select_newest, SlotCandidate};
use crate::swap::{OverwriteEngine, SwapEngine};
use crate::trailer::{Flag, Magic, SlotInfo, StatusSource, TrailerLayout};
use crate::{Error, Result};

/// Diagnostic callback, the only logging surface the core crates expose
/// (kept out of the core crates proper; a board layer implements this over
/// whatever transport it has, e.g. a semihosting print).
pub trait Listener {
    fn on_event(&mut self, _msg: &str) {}
}

/// Discards every event; the default when no board-level listener is wired.
pub struct NullListener;
impl Listener for NullListener {}

/// What the reset handler needs to chain into the selected image.
#[derive(Debug, Clone)]
pub struct BootResponse {
    pub dev_id: u32,
    pub image_off: u32,
    pub header: ImageHeader,
}

/// The counter id used for the single anti-rollback counter this boot loader
/// tracks per device. Multi-image configurations would index this by image
/// number; out of scope here (§1 Non-goals: single active image per area).
const PRIMARY_COUNTER: CounterId = CounterId(0);

pub struct BootController<'a, P: Flash, S: Flash, Sc: Flash, Y: Crypto, N: CounterStore> {
    pub primary: &'a mut P,
    pub secondary: &'a mut S,
    pub scratch: &'a mut Sc,
    pub crypto: Y,
    pub counters: N,
    pub policy: BootPolicy,
}

impl<'a, P: Flash, S: Flash, Sc: Flash, Y: Crypto, N: CounterStore> BootController<'a, P, S, Sc, Y, N> {
    /// Run the full boot sequence and return the slot the reset handler
    /// should chain into. `listener` receives progress events; `handoff` is
    /// an optional buffer to receive the terminal handoff record (§6.6);
    /// `ram_dest` is an optional RAM destination, consulted only under
    /// `SwapAlgorithm::NewestWins` when the winning candidate isn't the
    /// primary slot (§4.1.1 step 4).
    pub fn boot_go(
        &mut self,
        listener: &mut impl Listener,
        handoff: Option<&mut [u8]>,
        ram_dest: Option<&mut [u8]>,
    ) -> Result<BootResponse> {
        match self.policy.algorithm {
            SwapAlgorithm::ScratchSwap => self.boot_go_scratch_swap(listener, handoff),
            SwapAlgorithm::OverwriteOnly => self.boot_go_overwrite(listener, handoff),
            SwapAlgorithm::NewestWins => self.boot_go_newest_wins(listener, handoff, ram_dest),
        }
    }

    /// Three-phase scratch-swap algorithm (§4.2): resume/start/confirm a
    /// sector swap between primary and secondary, reverting on a failed
    /// validation, a refused security counter, or a previous `Test` swap
    /// that was never confirmed (§4.1 steps 1-8, §8.2 seed scenario 3).
    fn boot_go_scratch_swap(
        &mut self,
        listener: &mut impl Listener,
        handoff: Option<&mut [u8]>,
    ) -> Result<BootResponse> {
        let primary_slot = SlotInfo::from_flash(self.primary);
        let primary_layout = TrailerLayout::new(&primary_slot)?;
        let secondary_slot = SlotInfo::from_flash(self.secondary);
        let secondary_layout = TrailerLayout::new(&secondary_slot)?;
        let scratch_slot = SlotInfo::from_flash(self.scratch);
        let scratch_layout = TrailerLayout::new(&scratch_slot)?;

        let primary_magic = primary_layout.read_magic(self.primary)?;
        let scratch_magic = scratch_layout.read_magic(self.scratch)?;
        let primary_copy_done = primary_layout.read_copy_done(self.primary)?;
        let primary_image_ok = primary_layout.read_image_ok(self.primary)?;

        let source = crate::trailer::status_source(primary_magic, scratch_magic, primary_copy_done);

        // Step 1-2: resume an interrupted swap (a status log entry survived
        // the crash that's being recovered from), start a fresh one if the
        // secondary slot's own trailer carries a pending upgrade request
        // this boot hasn't acted on yet, or revert a swap that completed on
        // an earlier boot but was never confirmed. The status log for the
        // in-progress swap lives wherever the trailer sector itself
        // currently resides (`StatusSource::Scratch` while that sector is
        // mid-swap, `StatusSource::Primary` once it's landed back).
        let mut swap_type = SwapType::None;
        let resume = match source {
            StatusSource::Primary => primary_layout.read_status(self.primary)?,
            StatusSource::Scratch => scratch_layout.read_status(self.scratch)?,
            StatusSource::None => None,
        };

        if let Some((idx, state)) = resume {
            listener.on_event("resuming interrupted swap");
            let mut engine = SwapEngine::new(&mut *self.primary, &mut *self.secondary, &mut *self.scratch)?;
            engine.run(Some((idx, state)))?;
            swap_type = SwapType::Test;
        } else if secondary_layout.read_magic(self.secondary)? == Magic::Good {
            listener.on_event("starting upgrade swap");
            let mut engine = SwapEngine::new(&mut *self.primary, &mut *self.secondary, &mut *self.scratch)?;
            engine.run(None)?;
            swap_type = SwapType::Test;
        } else if primary_magic == Magic::Good && primary_copy_done == Flag::Unset {
            // A previous swap finished writing data but never got to mark
            // copy_done; nothing more to move, just finish the bookkeeping
            // so future boots see `StatusSource::None`.
            primary_layout.write_copy_done(self.primary)?;
        } else if primary_magic == Magic::Good && primary_copy_done == Flag::Set && primary_image_ok == Flag::Unset {
            // An earlier `Test` swap completed and nothing has confirmed it
            // since; undo it now (mirrors `boot_swap_if_needed` deriving
            // `BOOT_SWAP_TYPE_REVERT` from `image_ok`).
            listener.on_event("reverting unconfirmed test swap");
            let mut engine = SwapEngine::new(&mut *self.primary, &mut *self.secondary, &mut *self.scratch)?;
            engine.run(None)?;
            swap_type = SwapType::Revert;
        }

        // A revert's outcome is final: confirm the restored image right
        // away so the device doesn't try to re-revert (and swap itself back
        // into the unconfirmed state) on the next boot. Past this point
        // there's no further fallback if the write fails.
        if swap_type == SwapType::Revert && primary_layout.write_image_ok(self.primary).is_err() {
            return Err(Error::Panic);
        }

        // Step 3: authenticate the candidate now resident in primary.
        let image = Image::from_flash(self.primary)?;
        let policy = if self.policy.validate_primary {
            ValidatePolicy::Full
        } else {
            ValidatePolicy::MagicOnly
        };
        let validate_result = image.validate(self.primary, &self.crypto, policy);

        if let Err(e) = validate_result {
            if swap_type == SwapType::Test {
                // Revert: the algorithm is symmetric, so running it again
                // exchanges primary and secondary back.
                listener.on_event("candidate failed validation, reverting");
                let mut engine = SwapEngine::new(&mut *self.primary, &mut *self.secondary, &mut *self.scratch)?;
                engine.run(None)?;
            }
            return Err(e);
        }

        // Step 4: anti-rollback. A refused counter leaves the candidate
        // resident in primary without anything having confirmed it, so
        // undo the swap that brought it in before returning the error —
        // otherwise the device is left unable to boot either slot.
        if let Some(counter) = image.security_counter(self.primary)? {
            if let Err(e) = self.counters.update(PRIMARY_COUNTER, counter) {
                if swap_type == SwapType::Test {
                    listener.on_event("candidate's security counter rejected, reverting");
                    let mut engine = SwapEngine::new(&mut *self.primary, &mut *self.secondary, &mut *self.scratch)?;
                    engine.run(None)?;
                }
                return Err(e.into());
            }
        }

        // Step 5: confirm or leave pending. A "Test" swap leaves `image_ok`
        // unset so an unconfirmed upgrade reverts on the next boot; the
        // running application confirms it later by calling
        // `TrailerLayout::write_image_ok` directly. This controller never
        // writes it itself for a fresh Test swap, since only the
        // application can attest the new image actually works.

        // Step 6: handoff record.
        if let Some(buf) = handoff {
            let digest = image.stored_hash(self.primary)?.unwrap_or([0u8; crypto::HASH_LEN]);
            let mut writer = HandoffWriter::new(buf);
            writer.add_hash(&digest)?;
            writer.add_version(&image.header.version)?;
            writer.finish();
        }

        Ok(BootResponse {
            dev_id: self.primary.device_id(),
            image_off: 0,
            header: image.header,
        })
    }

    /// Compact variant (§4.2 "compact overwrite-only"): no trailer, no
    /// resume, no revert. A secondary image is only ever copied in if it
    /// authenticates and is strictly newer than what's already in primary;
    /// a candidate that fails validation after being copied in leaves the
    /// device bricked rather than reverted, the risk `SwapAlgorithm::
    /// OverwriteOnly` accepts in exchange for not needing a scratch area.
    fn boot_go_overwrite(
        &mut self,
        listener: &mut impl Listener,
        handoff: Option<&mut [u8]>,
    ) -> Result<BootResponse> {
        let policy = if self.policy.validate_primary {
            ValidatePolicy::Full
        } else {
            ValidatePolicy::MagicOnly
        };

        let mut should_overwrite = false;
        if let Ok(candidate) = Image::from_flash(self.secondary) {
            if candidate.validate(self.secondary, &self.crypto, policy).is_ok() {
                should_overwrite = match Image::from_flash(self.primary) {
                    Ok(current) => candidate.header.version.packed() > current.header.version.packed(),
                    Err(_) => true,
                };
            }
        }

        if should_overwrite {
            listener.on_event("starting overwrite swap");
            let mut engine = OverwriteEngine::new(&mut *self.primary, &mut *self.secondary);
            engine.run()?;
        }

        let image = Image::from_flash(self.primary)?;
        image.validate(self.primary, &self.crypto, policy)?;

        if let Some(counter) = image.security_counter(self.primary)? {
            self.counters.update(PRIMARY_COUNTER, counter)?;
        }

        if let Some(buf) = handoff {
            let digest = image.stored_hash(self.primary)?.unwrap_or([0u8; crypto::HASH_LEN]);
            let mut writer = HandoffWriter::new(buf);
            writer.add_hash(&digest)?;
            writer.add_version(&image.header.version)?;
            writer.finish();
        }

        Ok(BootResponse {
            dev_id: self.primary.device_id(),
            image_off: 0,
            header: image.header,
        })
    }

    /// RAM-load variant (§4.1.1): no flash swap at all, just pick the
    /// newest authenticated slot between primary and secondary. If
    /// secondary wins, it can't be chained into in place, so it's relocated
    /// into `ram_dest` when the caller supplies one.
    fn boot_go_newest_wins(
        &mut self,
        listener: &mut impl Listener,
        handoff: Option<&mut [u8]>,
        ram_dest: Option<&mut [u8]>,
    ) -> Result<BootResponse> {
        let policy = if self.policy.validate_primary {
            ValidatePolicy::Full
        } else {
            ValidatePolicy::MagicOnly
        };

        let primary_image = Image::from_flash(self.primary).ok();
        let mut primary_valid = false;
        if let Some(img) = &primary_image {
            primary_valid = img.validate(self.primary, &self.crypto, policy).is_ok();
        }
        let secondary_image = Image::from_flash(self.secondary).ok();
        let mut secondary_valid = false;
        if let Some(img) = &secondary_image {
            secondary_valid = img.validate(self.secondary, &self.crypto, policy).is_ok();
        }

        let primary_header = primary_image.as_ref().map(|i| i.header).unwrap_or_default();
        let secondary_header = secondary_image.as_ref().map(|i| i.header).unwrap_or_default();
        let candidates = [
            SlotCandidate { index: 0, header: primary_header, valid: primary_valid },
            SlotCandidate { index: 1, header: secondary_header, valid: secondary_valid },
        ];
        let winner = select_newest(&candidates).ok_or(Error::BadImage)?;

        if winner == 0 {
            listener.on_event("newest-wins: booting primary in place");
            let image = primary_image.unwrap();
            if let Some(counter) = image.security_counter(self.primary)? {
                self.counters.update(PRIMARY_COUNTER, counter)?;
            }
            if let Some(buf) = handoff {
                let digest = image.stored_hash(self.primary)?.unwrap_or([0u8; crypto::HASH_LEN]);
                let mut writer = HandoffWriter::new(buf);
                writer.add_hash(&digest)?;
                writer.add_version(&image.header.version)?;
                writer.finish();
            }
            Ok(BootResponse {
                dev_id: self.primary.device_id(),
                image_off: 0,
                header: image.header,
            })
        } else {
            listener.on_event("newest-wins: relocating secondary to RAM");
            let image = secondary_image.unwrap();
            if let Some(counter) = image.security_counter(self.secondary)? {
                self.counters.update(PRIMARY_COUNTER, counter)?;
            }
            if let Some(dest) = ram_dest {
                ram_copy(self.secondary, &image.header, dest)?;
            }
            if let Some(buf) = handoff {
                let digest = image.stored_hash(self.secondary)?.unwrap_or([0u8; crypto::HASH_LEN]);
                let mut writer = HandoffWriter::new(buf);
                writer.add_hash(&digest)?;
                writer.add_version(&image.header.version)?;
                writer.finish();
            }
            Ok(BootResponse {
                dev_id: self.secondary.device_id(),
                image_off: 0,
                header: image.header,
            })
        }
    }
}

/// Chain execution to the selected image. Never returns on a real target;
/// under `test`, returns instead so the harness can observe the call
/// happened, the one deliberate divergence from "never returns".
#[cfg(not(test))]
pub fn chain_to_image(_dev_id: u32, _image_off: u32, _header: &ImageHeader) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
pub fn chain_to_image(_dev_id: u32, _image_off: u32, _header: &ImageHeader) {}
