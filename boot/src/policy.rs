//! Swap type and build-time policy enums (§4.1, §9 Open Questions).

/// What kind of update cycle is in effect. Derived either from the
/// trailer's flags (a fresh request) or from resuming an interrupted swap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SwapType {
    /// No pending upgrade; boot primary as-is.
    None,
    /// Swap in, but revert on the next boot unless `image_ok` gets set.
    Test,
    /// Swap in permanently; set `image_ok` immediately.
    Perm,
    /// Undo a previous `Test` swap that was never confirmed.
    Revert,
    /// The candidate image failed validation; erase it and boot primary.
    Fail,
    /// A post-swap flag write failed after the point of no return; halt.
    Panic,
}

/// Build-time choice between the two variants the source preserves (§9
/// Open Question: "Image 0/1" scratch swap vs. newest-wins multi-slot
/// selection).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SwapAlgorithm {
    /// Three-phase scratch-based sector swap with trailer tracking (§4.2).
    ScratchSwap,
    /// Compact variant: overwrite primary with secondary wholesale, no
    /// trailer, no resume support (§4.2 "compact overwrite-only variant").
    OverwriteOnly,
    /// No swap at all; boot the newest validated slot among N, optionally
    /// copying it to RAM first (§4.1.1).
    NewestWins,
}

/// Runtime policy the boot controller is configured with.
#[derive(Debug, Copy, Clone)]
pub struct BootPolicy {
    pub algorithm: SwapAlgorithm,
    /// Full hash/signature verification of the primary slot vs. a
    /// magic-only check (§4.1 step 5).
    pub validate_primary: bool,
}

impl Default for BootPolicy {
    fn default() -> Self {
        BootPolicy {
            algorithm: SwapAlgorithm::ScratchSwap,
            validate_primary: true,
        }
    }
}
