//! Image generation.
//!
//! Builds a signed, TLV-terminated image in memory using [`crypto`]'s
//! software backend by default. The `imgtool` feature switches to shelling
//! out to the real external signing tool instead, for parity testing against
//! a device-flashing workflow; it is not exercised by the default test run.

use std::mem::size_of;

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

use anyhow::Result;
use asraw::AsRaw;
use crypto::{Crypto, SoftwareCrypto, HASH_LEN};

pub struct GeneratedImage {
    pub data: Vec<u8>,
}

pub struct GenBuilder {
    /// Size of the zeroed header.
    header_size: usize,
    /// Total size of the image, not counting the TLV.
    size: usize,
    /// Seed for the PRNG
    seed: usize,
    /// Version
    version: (u8, u8, u16, u32),
    /// Anti-rollback security-counter TLV value, if any.
    security_counter: Option<u32>,
}

impl Default for GenBuilder {
    fn default() -> Self {
        GenBuilder {
            header_size: 256,
            size: 76_137,
            seed: 1,
            version: (0, 1, 0, 0),
            security_counter: None,
        }
    }
}

impl GenBuilder {
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    pub fn seed(&mut self, seed: usize) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn version(&mut self, major: u8, minor: u8, revision: u16, build_num: u32) -> &mut Self {
        self.version = (major, minor, revision, build_num);
        self
    }

    pub fn security_counter(&mut self, value: u32) -> &mut Self {
        self.security_counter = Some(value);
        self
    }

    /// Build a signed image and the signing key used, so a caller can
    /// construct a matching [`SoftwareCrypto`] verifier.
    pub fn build_signed(&self) -> Result<(GeneratedImage, p256::ecdsa::SigningKey)> {
        use boot::{ImageHeader, ImageVersion, TlvKind};
        use signature::Signer;

        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed as u64);
        let mut body = vec![0u8; self.size];
        rng.fill_bytes(&mut body);

        let sk = p256::ecdsa::SigningKey::from_bytes(&[0x11u8; 32].into())
            .map_err(|e| anyhow::anyhow!("bad signing key seed: {e}"))?;
        let vk = p256::ecdsa::VerifyingKey::from(&sk);
        let crypto = SoftwareCrypto::new([0x22u8; 32], vk.to_sec1_bytes().as_ref())
            .map_err(|e| anyhow::anyhow!("bad verify key: {:?}", e))?;

        let mut header = ImageHeader::default();
        header.magic = boot::IMAGE_MAGIC;
        header.hdr_size = self.header_size as u16;
        header.img_size = body.len() as u32;
        header.version = ImageVersion {
            major: self.version.0,
            minor: self.version.1,
            revision: self.version.2,
            build_num: self.version.3,
        };

        let mut image = vec![0u8; self.header_size];
        image[..size_of::<ImageHeader>()].copy_from_slice(header.as_raw());
        image.extend_from_slice(&body);

        let mut digest = [0u8; HASH_LEN];
        crypto.hash(&image, &mut digest);
        let sig: p256::ecdsa::Signature = sk.sign(&digest);
        let sig_bytes = sig.to_bytes();

        let counter_bytes = self.security_counter.map(|c| c.to_le_bytes());
        let extra = counter_bytes
            .as_ref()
            .map(|bytes| (TlvKind::SecurityCounter, bytes.as_slice()));
        let tlv = build_tlv_block(TlvKind::Sha256, &digest, TlvKind::EcdsaSig, &sig_bytes, extra);
        image.extend_from_slice(&tlv);

        Ok((GeneratedImage { data: image }, sk))
    }

    #[cfg(feature = "imgtool")]
    pub fn build(&self) -> Result<GeneratedImage> {
        use std::{
            fs::{self, File},
            io::Write,
            process::{Command, Stdio},
        };
        use temp_dir::TempDir;

        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed as u64);
        let mut input = vec![0u8; self.size];
        rng.fill_bytes(&mut input);
        input[..self.header_size].fill(0);

        let tmp = TempDir::new()?;
        let src = tmp.path().join("image.bin");
        let dest = tmp.path().join("image-signed.bin");
        File::create(&src)?.write_all(&input)?;

        let mut cmd = Command::new("imgtool");
        cmd.arg("sign");
        cmd.arg("--header-size").arg(format!("{}", self.header_size));
        cmd.arg("-v").arg(format!(
            "{}.{}.{}",
            self.version.0, self.version.1, self.version.2
        ));
        cmd.arg("--align").arg("4");
        cmd.arg("--slot-size").arg(format!("{}", 128 * 1024));
        cmd.arg(&src);
        cmd.arg(&dest);
        cmd.stdin(Stdio::null());

        let status = cmd.status()?;
        if !status.success() {
            return Err(anyhow::anyhow!("unable to run imgtool: {}", status));
        }

        Ok(GeneratedImage { data: fs::read(&dest)? })
    }
}

/// Lay out a minimal TLV block: info header, then the two entries, in the
/// layout `Image::find_tlv` expects (§3.2).
fn build_tlv_block(
    kind_a: boot::TlvKind,
    val_a: &[u8],
    kind_b: boot::TlvKind,
    val_b: &[u8],
    extra: Option<(boot::TlvKind, &[u8])>,
) -> Vec<u8> {
    #[repr(C)]
    #[derive(Default, Clone, Copy)]
    struct TlvInfo {
        magic: u16,
        len: u16,
    }
    impl AsRaw for TlvInfo {}

    #[repr(C)]
    #[derive(Default, Clone, Copy)]
    struct TlvEntry {
        kind: u16,
        len: u16,
    }
    impl AsRaw for TlvEntry {}

    const INFO_MAGIC: u16 = 0x6907;

    let mut body = Vec::new();
    let entry_a = TlvEntry { kind: kind_a as u16, len: val_a.len() as u16 };
    body.extend_from_slice(entry_a.as_raw());
    body.extend_from_slice(val_a);
    let entry_b = TlvEntry { kind: kind_b as u16, len: val_b.len() as u16 };
    body.extend_from_slice(entry_b.as_raw());
    body.extend_from_slice(val_b);

    if let Some((kind_c, val_c)) = extra {
        let entry_c = TlvEntry { kind: kind_c as u16, len: val_c.len() as u16 };
        body.extend_from_slice(entry_c.as_raw());
        body.extend_from_slice(val_c);
    }

    let info = TlvInfo {
        magic: INFO_MAGIC,
        len: (size_of::<TlvInfo>() + body.len()) as u16,
    };
    let mut out = Vec::new();
    out.extend_from_slice(info.as_raw());
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::styles;

    #[test]
    fn test_gen_signed() {
        let (img, sk) = GenBuilder::default().size(2048).build_signed().unwrap();
        let mut flash = styles::LPC_MAIN.build().unwrap();
        flash.install(&img.data, 0).unwrap();

        let vk = p256::ecdsa::VerifyingKey::from(&sk);
        let crypto = SoftwareCrypto::new([0x22u8; 32], vk.to_sec1_bytes().as_ref()).unwrap();

        let image = boot::Image::from_flash(&mut flash).unwrap();
        image
            .validate(&mut flash, &crypto, boot::ValidatePolicy::Full)
            .unwrap();
    }
}
