//! Boot image support (§3.2).
//!
//! An image is a bootable image residing in a flash partition: a fixed
//! header, an opaque payload, and a TLV block carrying the hash, the
//! signature, and (optionally) the image's security-counter value.

use core::mem::size_of;

use asraw::{AsMutRaw, AsRaw};
use crypto::{Crypto, HASH_LEN};
use storage::Flash;

use crate::{Error, Result};

/// The image header contains the following magic value, indicating the
/// interpretation of the rest of the image header.
pub const IMAGE_MAGIC: u32 = 0x96f3b83d;

const INFO_MAGIC: u16 = 0x6907;

/// TLV entry kinds understood by this loader. Unknown kinds are skipped.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u16)]
pub enum TlvKind {
    Sha256 = 0x10,
    EcdsaSig = 0x22,
    SecurityCounter = 0x50,
}

impl TlvKind {
    fn from_u16(v: u16) -> Option<TlvKind> {
        match v {
            0x10 => Some(TlvKind::Sha256),
            0x22 => Some(TlvKind::EcdsaSig),
            0x50 => Some(TlvKind::SecurityCounter),
            _ => None,
        }
    }
}

/// How thoroughly an image must be authenticated before it is allowed to
/// boot (§4.1 step 5).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ValidatePolicy {
    /// Full hash + signature verification.
    Full,
    /// Magic check only; used when `VALIDATE_PRIMARY` is not configured.
    MagicOnly,
}

/// Try to make this image into a u32, returning a locally meaningful result
/// type.
fn to_u32(v: usize) -> Result<u32> {
    v.try_into().map_err(|_| Error::BadImage)
}

/// An image is a bootable image residing in a flash partition. There is a
/// header at the beginning, and metadata (the TLV block) immediately
/// following the image body.
#[derive(Debug)]
pub struct Image {
    pub header: ImageHeader,
    tlv_base: u32,
    tlv_len: u16,
}

impl Image {
    /// Make an image from flash, if the image is valid. Does not
    /// authenticate; call [`Image::validate`] before trusting the content.
    pub fn from_flash<F: Flash>(flash: &mut F) -> Result<Image> {
        let mut header = ImageHeader::default();
        flash
            .read(0, header.as_mut_raw())
            .map_err(|_| Error::Flash)?;

        if header.magic != IMAGE_MAGIC {
            return Err(Error::BadImage);
        }

        // Find the base address of the TLV.
        let tlv_base = (header.img_size as usize)
            .checked_add(header.hdr_size as usize)
            .ok_or(Error::BadImage)?;

        let mut info = TlvInfo::default();
        flash
            .read(tlv_base, info.as_mut_raw())
            .map_err(|_| Error::Flash)?;

        if info.magic != INFO_MAGIC {
            return Err(Error::BadImage);
        }

        Ok(Image {
            header,
            tlv_base: to_u32(tlv_base)?,
            tlv_len: info.len,
        })
    }

    /// Walk the TLV block looking for `kind`, reading its value into `out`.
    /// Returns `Ok(None)` if the TLV is absent.
    fn find_tlv<F: Flash>(
        &self,
        flash: &mut F,
        kind: TlvKind,
        out: &mut [u8],
    ) -> Result<Option<usize>> {
        let mut pos = size_of::<TlvEntry>();
        while pos < self.tlv_len as usize {
            let mut entry = TlvEntry::default();
            let entry_off = self.tlv_base as usize + pos;
            flash
                .read(entry_off, entry.as_mut_raw())
                .map_err(|_| Error::Flash)?;
            pos += size_of::<TlvEntry>();

            if TlvKind::from_u16(entry.kind) == Some(kind) {
                let len = entry.len as usize;
                if len > out.len() {
                    return Err(Error::BadImage);
                }
                flash
                    .read(self.tlv_base as usize + pos, &mut out[..len])
                    .map_err(|_| Error::Flash)?;
                return Ok(Some(len));
            }

            pos += entry.len as usize;
        }
        Ok(None)
    }

    /// Read back the image's stored SHA-256 digest TLV, if present. Used by
    /// the boot handoff record; does not itself authenticate anything.
    pub fn stored_hash<F: Flash>(&self, flash: &mut F) -> Result<Option<[u8; HASH_LEN]>> {
        let mut buf = [0u8; HASH_LEN];
        match self.find_tlv(flash, TlvKind::Sha256, &mut buf)? {
            Some(HASH_LEN) => Ok(Some(buf)),
            Some(_) => Err(Error::BadImage),
            None => Ok(None),
        }
    }

    /// Read the image's embedded anti-rollback security counter, if present
    /// (§3.2, §4.6).
    pub fn security_counter<F: Flash>(&self, flash: &mut F) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        match self.find_tlv(flash, TlvKind::SecurityCounter, &mut buf)? {
            Some(4) => Ok(Some(u32::from_le_bytes(buf))),
            Some(_) => Err(Error::BadImage),
            None => Ok(None),
        }
    }

    /// Hash the header, body, and protected TLVs, then either fully verify
    /// the signature or merely accept the magic check, per `policy`
    /// (§4.1 step 5).
    pub fn validate<F: Flash, C: Crypto>(
        &self,
        flash: &mut F,
        crypto: &C,
        policy: ValidatePolicy,
    ) -> Result<()> {
        if policy == ValidatePolicy::MagicOnly {
            return Ok(());
        }

        let digest = self.compute_digest(flash, crypto)?;

        let mut stored_hash = [0u8; HASH_LEN];
        match self.find_tlv(flash, TlvKind::Sha256, &mut stored_hash)? {
            Some(HASH_LEN) => {}
            _ => return Err(Error::BadImage),
        }
        if stored_hash != digest {
            return Err(Error::BadImage);
        }

        let mut sig = [0u8; 64];
        match self.find_tlv(flash, TlvKind::EcdsaSig, &mut sig)? {
            Some(64) => {}
            _ => return Err(Error::BadImage),
        }
        crypto
            .verify_signature(&digest, &sig)
            .map_err(|_| Error::AuthFail)
    }

    /// Compute the SHA-256 digest over header + body + protected TLVs.
    ///
    /// This reads the whole authenticated range into one bounded scratch
    /// buffer; a real target would stream it through a running hash context
    /// instead, but the boundary (`hdr_size + img_size + protected_tlv_size`)
    /// is the same either way.
    fn compute_digest<F: Flash, C: Crypto>(
        &self,
        flash: &mut F,
        crypto: &C,
    ) -> Result<[u8; HASH_LEN]> {
        const MAX_DIGEST_INPUT: usize = 1024 * 1024;
        let total = self.header.hdr_size as usize
            + self.header.img_size as usize
            + self.header.protected_tlv_size as usize;
        if total > MAX_DIGEST_INPUT {
            return Err(Error::BadImage);
        }

        let mut buf = heapless::Vec::<u8, MAX_DIGEST_INPUT>::new();
        buf.resize(total, 0).map_err(|_| Error::BadImage)?;
        flash.read(0, &mut buf).map_err(|_| Error::Flash)?;

        let mut out = [0u8; HASH_LEN];
        crypto.hash(&buf, &mut out);
        Ok(out)
    }
}

/// Header flags (§3.2).
pub mod flags {
    pub const NON_BOOTABLE: u32 = 0x0000_0001;
    pub const RAM_LOAD: u32 = 0x0000_0002;
}

/// The image begins with the following header. This is intended to be
/// interpreted as a C struct.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ImageHeader {
    /// Magic number, indicates this particular header.
    pub magic: u32,
    /// The address to load this image. Only used for non-XIP. It seems to
    /// be used if non-zero, which assumes that RAM does not start at
    /// address zero.
    pub load_addr: u32,
    /// The size of the header. This struct is at the beginning, and there
    /// is some amount of padding before the actual image starts. This is
    /// used because many architectures place alignment requirements on the
    /// runnable image.
    pub hdr_size: u16,
    /// The size of the protected TLV. The size is included here. See below
    /// on the TLV for the meaning of this value.
    pub protected_tlv_size: u16,
    /// The size of the image, not counting the header.
    pub img_size: u32,
    /// Flags for this image; see the `flags` module.
    pub flags: u32,
    /// Version of this particular image.
    pub version: ImageVersion,
    /// Padding, to reach a nicely aligned minimum size.
    pad1: u32,
}

impl AsRaw for ImageHeader {}
unsafe impl AsMutRaw for ImageHeader {}

/// Each image has a version. This is a pseudo-semantic version used to
/// determine upgrade eligibility and compatibility between multi-image
/// setups.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[repr(C)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

impl ImageVersion {
    /// Pack into a single u64 so a plain numeric comparison gives the
    /// correct newest-wins ordering (§4.1.1 step 2).
    pub fn packed(&self) -> u64 {
        ((self.major as u64) << 56)
            | ((self.minor as u64) << 48)
            | ((self.revision as u64) << 32)
            | (self.build_num as u64)
    }
}

/// The TLV block contains this header.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct TlvInfo {
    /// Magic, `INFO_MAGIC`.
    magic: u16,
    /// Length of TLV, including this header.
    len: u16,
}

impl AsRaw for TlvInfo {}
unsafe impl AsMutRaw for TlvInfo {}

/// Each TLV entry is preceded by this header.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct TlvEntry {
    /// One of the `TlvKind` values.
    kind: u16,
    /// Length of the value that follows.
    len: u16,
}

impl AsRaw for TlvEntry {}
unsafe impl AsMutRaw for TlvEntry {}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::SoftwareCrypto;
    use simflash::{styles, SimFlash};

    fn build_signed_image(body: &[u8], hdr_size: usize) -> (Vec<u8>, p256::ecdsa::SigningKey) {
        let sk = p256::ecdsa::SigningKey::from_bytes(&[5u8; 32].into()).unwrap();
        let vk = p256::ecdsa::VerifyingKey::from(&sk);
        let crypto = SoftwareCrypto::new([1u8; 32], vk.to_sec1_bytes().as_ref()).unwrap();

        let mut header = ImageHeader::default();
        header.magic = IMAGE_MAGIC;
        header.hdr_size = hdr_size as u16;
        header.img_size = body.len() as u32;
        header.version = ImageVersion { major: 1, minor: 0, revision: 0, build_num: 1 };

        let mut image = vec![0u8; hdr_size];
        image[..size_of::<ImageHeader>()].copy_from_slice(header.as_raw());
        image.extend_from_slice(body);

        let mut digest = [0u8; HASH_LEN];
        crypto.hash(&image, &mut digest);

        use signature::Signer;
        let sig: p256::ecdsa::Signature = sk.sign(&digest);
        let sig_bytes = sig.to_bytes();

        let mut tlv_block = Vec::new();
        let hash_entry = TlvEntry { kind: TlvKind::Sha256 as u16, len: HASH_LEN as u16 };
        tlv_block.extend_from_slice(hash_entry.as_raw());
        tlv_block.extend_from_slice(&digest);
        let sig_entry = TlvEntry { kind: TlvKind::EcdsaSig as u16, len: 64 };
        tlv_block.extend_from_slice(sig_entry.as_raw());
        tlv_block.extend_from_slice(&sig_bytes);

        let info = TlvInfo {
            magic: INFO_MAGIC,
            len: (size_of::<TlvInfo>() + tlv_block.len()) as u16,
        };
        let mut full_tlv = Vec::new();
        full_tlv.extend_from_slice(info.as_raw());
        full_tlv.extend_from_slice(&tlv_block);

        image.extend_from_slice(&full_tlv);
        (image, sk)
    }

    #[test]
    fn roundtrip_and_validate() {
        let layout = &styles::LPC_MAIN;
        let mut flash = layout.build().unwrap();
        let (image, _sk) = build_signed_image(b"hello world image body", 512);
        flash.install(&image, 0).unwrap();

        let vk = p256::ecdsa::VerifyingKey::from(
            &p256::ecdsa::SigningKey::from_bytes(&[5u8; 32].into()).unwrap(),
        );
        let crypto = SoftwareCrypto::new([1u8; 32], vk.to_sec1_bytes().as_ref()).unwrap();

        let parsed = Image::from_flash(&mut flash).unwrap();
        parsed.validate(&mut flash, &crypto, ValidatePolicy::Full).unwrap();
    }

    #[test]
    fn tampered_body_fails_validation() {
        let layout = &styles::LPC_MAIN;
        let mut flash = layout.build().unwrap();
        let (mut image, _sk) = build_signed_image(b"hello world image body", 512);
        image[512] ^= 0xff;
        flash.install(&image, 0).unwrap();

        let vk = p256::ecdsa::VerifyingKey::from(
            &p256::ecdsa::SigningKey::from_bytes(&[5u8; 32].into()).unwrap(),
        );
        let crypto = SoftwareCrypto::new([1u8; 32], vk.to_sec1_bytes().as_ref()).unwrap();

        let parsed = Image::from_flash(&mut flash).unwrap();
        assert!(parsed.validate(&mut flash, &crypto, ValidatePolicy::Full).is_err());
    }
}
