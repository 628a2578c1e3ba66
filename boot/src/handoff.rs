//! Boot handoff / measurement record (§6.6, supplemented from the original
//! attestation-adjacent shared-memory region TF-M's `bl2_main.c` leaves for
//! the runtime firmware). Pure TLV data layout; no attestation verification
//! or IPC surface is implemented here.

use byteorder::{ByteOrder, LittleEndian};

use crate::image::ImageVersion;
use crate::{Error, Result};

pub const HANDOFF_MAGIC: u32 = 0x484f_4646;

const KIND_HASH: u16 = 1;
const KIND_VERSION: u16 = 2;

const HEADER_LEN: usize = 8;
const RECORD_HEADER_LEN: usize = 4;

/// Serializes handoff records (`magic | total_len | [kind, len, value]*`)
/// into a caller-owned buffer — typically a small region of RAM or
/// battery-backed memory shared with the next-stage firmware.
pub struct HandoffWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> HandoffWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        HandoffWriter { buf, pos: HEADER_LEN }
    }

    pub fn add_hash(&mut self, hash: &[u8; crypto::HASH_LEN]) -> Result<()> {
        self.add_record(KIND_HASH, hash)
    }

    pub fn add_version(&mut self, version: &ImageVersion) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, version.packed());
        self.add_record(KIND_VERSION, &buf)
    }

    fn add_record(&mut self, kind: u16, data: &[u8]) -> Result<()> {
        let need = RECORD_HEADER_LEN + data.len();
        if self.pos + need > self.buf.len() {
            return Err(Error::BadImage);
        }
        LittleEndian::write_u16(&mut self.buf[self.pos..], kind);
        LittleEndian::write_u16(&mut self.buf[self.pos + 2..], data.len() as u16);
        self.buf[self.pos + RECORD_HEADER_LEN..self.pos + need].copy_from_slice(data);
        self.pos += need;
        Ok(())
    }

    /// Write the header (magic + total length) and return the total record
    /// length written.
    pub fn finish(self) -> usize {
        let total = self.pos;
        LittleEndian::write_u32(&mut self.buf[0..4], HANDOFF_MAGIC);
        LittleEndian::write_u32(&mut self.buf[4..8], total as u32);
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_roundtrip_into_buffer() {
        let mut buf = [0u8; 128];
        let hash = [7u8; crypto::HASH_LEN];
        let version = ImageVersion { major: 1, minor: 2, revision: 3, build_num: 4 };

        let len = {
            let mut w = HandoffWriter::new(&mut buf);
            w.add_hash(&hash).unwrap();
            w.add_version(&version).unwrap();
            w.finish()
        };

        assert_eq!(LittleEndian::read_u32(&buf[0..4]), HANDOFF_MAGIC);
        assert_eq!(LittleEndian::read_u32(&buf[4..8]) as usize, len);

        let mut pos = HEADER_LEN;
        let kind = LittleEndian::read_u16(&buf[pos..]);
        let rec_len = LittleEndian::read_u16(&buf[pos + 2..]) as usize;
        assert_eq!(kind, KIND_HASH);
        assert_eq!(&buf[pos + RECORD_HEADER_LEN..pos + RECORD_HEADER_LEN + rec_len], &hash);
        pos += RECORD_HEADER_LEN + rec_len;

        let kind = LittleEndian::read_u16(&buf[pos..]);
        assert_eq!(kind, KIND_VERSION);
    }
}
