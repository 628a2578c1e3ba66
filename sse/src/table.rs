//! Object table (§4.5): the caller-facing `(uid, owner)` API layered over
//! the block engine. Every lookup filters on `owner` first and reports
//! `NotFound` for anything not owned by the caller — never a distinct
//! "permission denied", which would itself leak that the object exists
//! under a different owner (P-OwnerIsolation).

use crypto::Crypto;
use storage::Flash;

use crate::block::{BlockEngine, Mutation};
use crate::error::{Error, Result};
use crate::layout::{MAX_OBJECT_SIZE, TABLE_FILE_ID};
use crate::util::bounds_check;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ObjectInfo {
    pub cur_size: u32,
    pub max_size: u32,
}

pub struct ObjectTable<F: Flash, C: Crypto> {
    engine: BlockEngine<F, C>,
}

impl<F: Flash, C: Crypto> ObjectTable<F, C> {
    pub fn open(flash: F, crypto: C) -> Result<Self> {
        Ok(ObjectTable { engine: BlockEngine::new(flash, crypto)? })
    }

    fn find(&self, uid: u32, owner: u32) -> Option<usize> {
        self.engine.ram().objects.iter().position(|o| o.uid == uid && o.owner == owner)
    }

    fn alloc_fid(&self) -> u32 {
        let mut fid = TABLE_FILE_ID + 1;
        loop {
            if !self.engine.ram().objects.iter().any(|o| o.file_id == fid) {
                return fid;
            }
            fid += 1;
        }
    }

    /// Create or overwrite `uid`'s object. A write that outgrows the
    /// object's original reservation replaces it outright (delete, then
    /// reserve fresh) rather than failing.
    pub fn set(&mut self, uid: u32, owner: u32, data: &[u8]) -> Result<()> {
        if data.len() > MAX_OBJECT_SIZE {
            return Err(Error::ParamError);
        }
        if let Some(index) = self.find(uid, owner) {
            let obj = self.engine.ram().objects[index];
            if data.len() as u32 <= obj.max_size {
                self.engine.commit(Mutation::Write { index, offset: 0, data })?;
                return Ok(());
            }
            self.engine.commit(Mutation::Delete { index })?;
        }

        let file_id = self.alloc_fid();
        self.engine.commit(Mutation::Reserve {
            uid,
            owner,
            file_id,
            max_size: data.len().max(1) as u32,
        })?;
        if !data.is_empty() {
            let index = self.find(uid, owner).ok_or(Error::Flash)?;
            self.engine.commit(Mutation::Write { index, offset: 0, data })?;
        }
        Ok(())
    }

    /// Read `[offset, offset+len)` of `uid`'s object.
    pub fn get(&mut self, uid: u32, owner: u32, offset: u32, len: u32) -> Result<heapless::Vec<u8, MAX_OBJECT_SIZE>> {
        let index = self.find(uid, owner).ok_or(Error::NotFound)?;
        let obj = self.engine.ram().objects[index];
        bounds_check(obj.cur_size as usize, offset as usize, len as usize)?;
        let end = offset + len;

        let mut full = heapless::Vec::<u8, MAX_OBJECT_SIZE>::new();
        full.resize(obj.cur_size as usize, 0).map_err(|_| Error::ParamError)?;
        self.engine.read_object(index, &mut full)?;

        let mut out = heapless::Vec::<u8, MAX_OBJECT_SIZE>::new();
        out.extend_from_slice(&full[offset as usize..end as usize]).map_err(|_| Error::ParamError)?;
        Ok(out)
    }

    pub fn remove(&mut self, uid: u32, owner: u32) -> Result<()> {
        let index = self.find(uid, owner).ok_or(Error::NotFound)?;
        self.engine.commit(Mutation::Delete { index })
    }

    pub fn info(&self, uid: u32, owner: u32) -> Result<ObjectInfo> {
        let index = self.find(uid, owner).ok_or(Error::NotFound)?;
        let obj = self.engine.ram().objects[index];
        Ok(ObjectInfo { cur_size: obj.cur_size, max_size: obj.max_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::SoftwareCrypto;
    use simflash::styles;

    fn test_crypto() -> SoftwareCrypto {
        let sk = p256::ecdsa::SigningKey::from_bytes(&[5u8; 32].into()).unwrap();
        let vk = p256::ecdsa::VerifyingKey::from(&sk);
        SoftwareCrypto::new([8u8; 32], vk.to_sec1_bytes().as_ref()).unwrap()
    }

    #[test]
    fn set_get_remove_roundtrip() {
        let flash = styles::SSE_AREA.build().unwrap();
        let mut table = ObjectTable::open(flash, test_crypto()).unwrap();

        table.set(1, 100, b"hello world").unwrap();
        let out = table.get(1, 100, 0, 11).unwrap();
        assert_eq!(&out[..], b"hello world");

        let info = table.info(1, 100).unwrap();
        assert_eq!(info.cur_size, 11);

        table.remove(1, 100).unwrap();
        assert!(matches!(table.get(1, 100, 0, 1), Err(Error::NotFound)));
    }

    #[test]
    fn owner_isolation_hides_foreign_objects() {
        let flash = styles::SSE_AREA.build().unwrap();
        let mut table = ObjectTable::open(flash, test_crypto()).unwrap();
        table.set(1, 100, b"owner a's secret").unwrap();

        assert!(matches!(table.get(1, 200, 0, 1), Err(Error::NotFound)));
        assert!(matches!(table.info(1, 200), Err(Error::NotFound)));
        assert!(matches!(table.remove(1, 200), Err(Error::NotFound)));
    }

    #[test]
    fn set_growing_past_reservation_replaces_object() {
        let flash = styles::SSE_AREA.build().unwrap();
        let mut table = ObjectTable::open(flash, test_crypto()).unwrap();
        table.set(1, 100, b"short").unwrap();
        table.set(1, 100, b"a much longer value than before").unwrap();

        let out = table.get(1, 100, 0, 32).unwrap();
        assert_eq!(&out[..], b"a much longer value than before");
    }
}
