/// Authenticated page encryption.
///
/// Each page is sealed with XChaCha20-Poly1305 under a per-page subkey derived
/// from the 32-byte master key. The derivation mirrors the libsodium KDF:
/// BLAKE2b-256 keyed with the master key, salt = little-endian subkey id (the
/// page number), personal = the context string, empty message.
///
/// The metadata envelope stores a 16-byte nonce and the 16-byte MAC; the
/// 24-byte XChaCha nonce is the stored nonce zero-padded. The first encryption
/// of a page draws its nonce from the RNG, every later one increments it, so a
/// (key, nonce) pair is never reused for a single file.
use blake2b_simd::Params;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{GavranError, Result};
use crate::storage::metadata::{MAC_SIZE, STORED_NONCE_SIZE};

pub const KEY_SIZE: usize = 32;
const XNONCE_SIZE: usize = 24;

const SUBKEY_CONTEXT: &[u8; 8] = b"TxnPages";

/// 256-bit master key. Key material is zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; KEY_SIZE],
}

impl EncryptionKey {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        EncryptionKey { key }
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

fn derive_subkey(master: &EncryptionKey, page_num: u64) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut salt = [0u8; 16];
    salt[..8].copy_from_slice(&page_num.to_le_bytes());
    let mut personal = [0u8; 16];
    personal[..8].copy_from_slice(SUBKEY_CONTEXT);

    let hash = Params::new()
        .hash_length(KEY_SIZE)
        .key(master.as_bytes())
        .salt(&salt)
        .personal(&personal)
        .hash(&[]);

    let mut subkey = Zeroizing::new([0u8; KEY_SIZE]);
    subkey.copy_from_slice(hash.as_bytes());
    subkey
}

/// Advance the stored nonce for another encryption of the same page: random
/// on first use, little-endian increment afterwards.
pub(crate) fn next_nonce(current: &[u8; STORED_NONCE_SIZE]) -> [u8; STORED_NONCE_SIZE] {
    let mut nonce = *current;
    if nonce.iter().all(|&b| b == 0) {
        rand::thread_rng().fill_bytes(&mut nonce);
        return nonce;
    }
    for byte in nonce.iter_mut() {
        let (value, carry) = byte.overflowing_add(1);
        *byte = value;
        if !carry {
            break;
        }
    }
    nonce
}

fn expand_nonce(stored: &[u8; STORED_NONCE_SIZE]) -> XNonce {
    let mut full = [0u8; XNONCE_SIZE];
    full[..STORED_NONCE_SIZE].copy_from_slice(stored);
    XNonce::from(full)
}

/// Encrypt a page body in place, returning the MAC for the envelope.
pub(crate) fn encrypt_page(
    master: &EncryptionKey,
    page_num: u64,
    nonce: &[u8; STORED_NONCE_SIZE],
    data: &mut [u8],
) -> Result<[u8; MAC_SIZE]> {
    let subkey = derive_subkey(master, page_num);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&*subkey));
    let tag = cipher
        .encrypt_in_place_detached(&expand_nonce(nonce), &[], data)
        .map_err(|e| GavranError::Encryption {
            page_num,
            reason: e.to_string(),
        })?;
    Ok(tag.into())
}

/// Decrypt a page body in place. A page whose ciphertext and MAC are both
/// all-zero was extended but never written; it reads back as zeros.
pub(crate) fn decrypt_page(
    master: &EncryptionKey,
    page_num: u64,
    nonce: &[u8; STORED_NONCE_SIZE],
    mac: &[u8; MAC_SIZE],
    data: &mut [u8],
) -> Result<()> {
    let subkey = derive_subkey(master, page_num);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&*subkey));
    match cipher.decrypt_in_place_detached(
        &expand_nonce(nonce),
        &[],
        data,
        Tag::from_slice(mac),
    ) {
        Ok(()) => Ok(()),
        Err(_) => {
            let zero_data = data.iter().all(|&b| b == 0);
            let zero_mac = mac.iter().all(|&b| b == 0);
            if zero_data && zero_mac {
                data.fill(0);
                return Ok(());
            }
            Err(GavranError::Decryption { page_num })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::new([0x42u8; KEY_SIZE])
    }

    #[test]
    fn test_subkey_is_deterministic_per_page() {
        let key = test_key();
        assert_eq!(*derive_subkey(&key, 7), *derive_subkey(&key, 7));
        assert_ne!(*derive_subkey(&key, 7), *derive_subkey(&key, 8));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let nonce = next_nonce(&[0u8; STORED_NONCE_SIZE]);
        let mut data = vec![0xABu8; 8192];
        let mac = encrypt_page(&key, 3, &nonce, &mut data).unwrap();
        assert_ne!(data, vec![0xABu8; 8192]);
        decrypt_page(&key, 3, &nonce, &mac, &mut data).unwrap();
        assert_eq!(data, vec![0xABu8; 8192]);
    }

    #[test]
    fn test_tampered_page_is_rejected() {
        let key = test_key();
        let nonce = next_nonce(&[0u8; STORED_NONCE_SIZE]);
        let mut data = vec![0x55u8; 256];
        let mac = encrypt_page(&key, 3, &nonce, &mut data).unwrap();
        data[17] ^= 1;
        assert!(decrypt_page(&key, 3, &nonce, &mac, &mut data).is_err());
    }

    #[test]
    fn test_wrong_page_number_is_rejected() {
        let key = test_key();
        let nonce = next_nonce(&[0u8; STORED_NONCE_SIZE]);
        let mut data = vec![0x55u8; 256];
        let mac = encrypt_page(&key, 3, &nonce, &mut data).unwrap();
        assert!(decrypt_page(&key, 4, &nonce, &mac, &mut data).is_err());
    }

    #[test]
    fn test_untouched_page_reads_as_zeros() {
        let key = test_key();
        let mut data = vec![0u8; 256];
        decrypt_page(&key, 9, &[0u8; STORED_NONCE_SIZE], &[0u8; MAC_SIZE], &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_mac_with_nonzero_ciphertext_is_rejected() {
        // only the all-zero ciphertext + all-zero MAC pair is a fresh page;
        // a zeroed MAC over real bytes is corruption
        let key = test_key();
        let mut data = vec![0x31u8; 256];
        let result = decrypt_page(&key, 9, &[0u8; STORED_NONCE_SIZE], &[0u8; MAC_SIZE], &mut data);
        assert!(matches!(result, Err(GavranError::Decryption { page_num: 9 })));

        let mut data = vec![0u8; 256];
        let result = decrypt_page(&key, 9, &[0u8; STORED_NONCE_SIZE], &[0x07u8; MAC_SIZE], &mut data);
        assert!(matches!(result, Err(GavranError::Decryption { page_num: 9 })));
    }

    #[test]
    fn test_nonce_increments() {
        let first = next_nonce(&[0u8; STORED_NONCE_SIZE]);
        assert_ne!(first, [0u8; STORED_NONCE_SIZE]);
        let mut expected = first;
        let second = next_nonce(&first);
        expected[0] = expected[0].wrapping_add(1);
        if expected[0] != 0 {
            assert_eq!(second[0], expected[0]);
            assert_eq!(second[1..], first[1..]);
        }
    }
}
