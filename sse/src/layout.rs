//! On-flash metadata shapes for the secure storage area (§3.3).
//!
//! The area is two equal-size physical blocks that alternate active/scratch
//! roles exactly like the boot loader's own trailer-based swap, just with
//! the metadata and the object data living together in the active block
//! rather than in a dedicated trailer. Each active block holds, in order:
//! `BlockHeader` (tag + iv + swap count + version bookkeeping), the
//! block-meta array, the object-meta array, then the object payloads
//! themselves, appended after the metadata and compacted on delete.

use asraw::{AsMutRaw, AsRaw};

pub const MAX_BLOCKS: usize = 4;
pub const MAX_OBJECTS: usize = 32;
pub const MAX_OBJECT_SIZE: usize = 2048;

/// Logical file-ID reserved for the object table's own persisted copy of
/// itself (§4.5 "Persistence": the table persists as one reserved object).
pub const TABLE_FILE_ID: u32 = 0;

/// Describes one physical data block backing the area. With the two-block
/// active/scratch design this array always has exactly one live entry (the
/// active block itself); the array shape is kept general so a future
/// multi-block layout (larger areas split further) only has to grow `N`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct BlockMeta {
    pub phys_id: u32,
    pub data_start: u32,
    pub free_size: u32,
}

impl AsRaw for BlockMeta {}
unsafe impl AsMutRaw for BlockMeta {}

/// One object's metadata entry. `iv`/`tag` are zeroed and unused when the
/// engine is built without AEAD (§9 "preserve the encrypted/unencrypted
/// bifurcation" open question); `owner` is part of the key even though the
/// AAD used to seal the object is the file-ID alone, never the owner
/// (P-OwnerIsolation, §4.4).
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ObjectMeta {
    pub uid: u32,
    pub owner: u32,
    pub file_id: u32,
    pub data_offset: u32,
    pub max_size: u32,
    pub cur_size: u32,
    pub iv: [u8; 12],
    pub tag: [u8; 16],
}

impl AsRaw for ObjectMeta {}
unsafe impl AsMutRaw for ObjectMeta {}

impl ObjectMeta {
    pub const EMPTY: ObjectMeta = ObjectMeta {
        uid: 0,
        owner: 0,
        file_id: 0,
        data_offset: 0,
        max_size: 0,
        cur_size: 0,
        iv: [0; 12],
        tag: [0; 16],
    };

    pub fn is_live(&self) -> bool {
        self.max_size != 0
    }
}

/// The fixed-size header at the front of every active block.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct BlockHeader {
    /// AEAD tag over (this header minus `tag` itself) || block-meta array ||
    /// object-meta array (§4.3.3 authentication range).
    pub tag: [u8; 16],
    pub iv: [u8; 12],
    /// Monotonically-counted swap generation; 0 is newer than anything
    /// except 1 (the rollover rule, §4.3 "Newest-block election").
    pub active_swap_count: u32,
    pub fs_version: u32,
    pub scratch_data_block: u32,
}

impl AsRaw for BlockHeader {}
unsafe impl AsMutRaw for BlockHeader {}

/// Decide which of two `active_swap_count` values is newer, applying the
/// rollover rule: `0` counts as newer than any value except `1`.
pub fn is_newer(candidate: u32, current_best: u32) -> bool {
    if candidate == current_best {
        return false;
    }
    if candidate == 0 && current_best != 1 {
        return true;
    }
    if current_best == 0 && candidate != 1 {
        return false;
    }
    candidate > current_best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollover_rule() {
        assert!(is_newer(5, 4));
        assert!(!is_newer(4, 5));
        assert!(is_newer(0, 200));
        // The one exception to "0 beats everything": 1 is newer than 0.
        assert!(is_newer(1, 0));
        assert!(!is_newer(0, 1));
        assert!(is_newer(2, 1));
    }
}
