//! Per-object AEAD codec (§4.4).
//!
//! The AAD bound into every object's tag is always the object's internal
//! file-ID, never the caller-visible `uid`: two different owners' objects
//! that happen to collide on AAD would otherwise leak structural
//! information about each other across the owner boundary.

use crypto::{Crypto, IV_LEN, TAG_LEN};

use crate::error::{Error, Result};
use crate::layout::MAX_OBJECT_SIZE;

fn file_id_aad(file_id: u32) -> [u8; 4] {
    file_id.to_le_bytes()
}

/// Seal `plaintext` for `file_id`, deriving a fresh IV from `context`
/// (ordinarily the owning block's `active_swap_count`, since that's the
/// only monotonic counter available without an RNG) and `revision` (bumped
/// per write so the same file-id/context pair never reuses an IV).
pub fn encode_object(
    crypto: &impl Crypto,
    file_id: u32,
    revision: u64,
    plaintext: &[u8],
) -> Result<(heapless::Vec<u8, MAX_OBJECT_SIZE>, [u8; IV_LEN], [u8; TAG_LEN])> {
    if plaintext.len() > MAX_OBJECT_SIZE {
        return Err(Error::ParamError);
    }
    let mut iv = [0u8; IV_LEN];
    crypto.derive_iv(&file_id_aad(file_id), revision, &mut iv);

    let mut ciphertext = heapless::Vec::<u8, MAX_OBJECT_SIZE>::new();
    ciphertext.resize(plaintext.len(), 0).map_err(|_| Error::ParamError)?;
    let mut tag = [0u8; TAG_LEN];
    crypto.aead_seal(&iv, &file_id_aad(file_id), plaintext, &mut ciphertext, &mut tag)?;
    Ok((ciphertext, iv, tag))
}

/// Open a sealed object. `out` must already be sized to the expected
/// plaintext length (the caller reads `cur_size` from the object's
/// metadata entry first).
pub fn decode_object(
    crypto: &impl Crypto,
    file_id: u32,
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
    out: &mut [u8],
) -> Result<()> {
    if ciphertext.len() != out.len() {
        return Err(Error::ParamError);
    }
    crypto.aead_open(iv, &file_id_aad(file_id), ciphertext, out, tag)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::SoftwareCrypto;

    fn test_crypto() -> SoftwareCrypto {
        let sk = p256::ecdsa::SigningKey::from_bytes(&[3u8; 32].into()).unwrap();
        let vk = p256::ecdsa::VerifyingKey::from(&sk);
        SoftwareCrypto::new([9u8; 32], vk.to_sec1_bytes().as_ref()).unwrap()
    }

    #[test]
    fn roundtrip() {
        let c = test_crypto();
        let (ct, iv, tag) = encode_object(&c, 7, 1, b"secret bytes").unwrap();
        let mut out = vec![0u8; ct.len()];
        decode_object(&c, 7, &iv, &ct, &tag, &mut out).unwrap();
        assert_eq!(out, b"secret bytes");
    }

    #[test]
    fn wrong_file_id_fails_to_open() {
        let c = test_crypto();
        let (ct, iv, tag) = encode_object(&c, 7, 1, b"secret bytes").unwrap();
        let mut out = vec![0u8; ct.len()];
        assert!(decode_object(&c, 8, &iv, &ct, &tag, &mut out).is_err());
    }
}
