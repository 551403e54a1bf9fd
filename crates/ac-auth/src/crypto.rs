use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::errors::VaultError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the key accepted by [`encrypt`] and [`decrypt`].
///
/// The key is a hex SHA-256 digest carried as ASCII, not raw key material;
/// it is hashed again to the 32-byte AES key.
pub const KEY_SIZE: usize = 64;
pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

fn aes_key(key: &[u8]) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    if key.len() != KEY_SIZE {
        return Err(VaultError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: key.len(),
        });
    }

    let mut aes_key = Zeroizing::new([0u8; 32]);
    aes_key.copy_from_slice(&Sha256::digest(key));
    Ok(aes_key)
}

/// Fill `buf` from the OS random source
pub fn random_bytes(buf: &mut [u8]) -> Result<(), VaultError> {
    getrandom::fill(buf).map_err(|e| VaultError::Randomness(e.to_string()))
}

/// Encrypt with AES-256-CBC/PKCS#7 under a fresh IV, returning `iv || ciphertext`
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, VaultError> {
    let aes_key = aes_key(key)?;

    let mut iv = [0u8; IV_LEN];
    random_bytes(&mut iv)?;

    let cipher = Aes256CbcEnc::new_from_slices(aes_key.as_slice(), &iv).map_err(|_| {
        VaultError::InvalidKeyLength {
            expected: 32,
            actual: aes_key.len(),
        }
    })?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Split `iv || ciphertext` and decrypt it
pub fn decrypt(blob: &[u8], key: &[u8]) -> Result<Vec<u8>, VaultError> {
    let aes_key = aes_key(key)?;

    if blob.len() < IV_LEN + BLOCK_LEN || (blob.len() - IV_LEN) % BLOCK_LEN != 0 {
        return Err(VaultError::Decryption);
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);

    let cipher = Aes256CbcDec::new_from_slices(aes_key.as_slice(), iv)
        .map_err(|_| VaultError::Decryption)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| VaultError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(fill: u8) -> Vec<u8> {
        vec![fill; KEY_SIZE]
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key(b'a');
        let cases: [&[u8]; 4] = [b"", b"x", b"refresh-token-0123456789abcdef", &[0u8; 48]];
        for plaintext in cases {
            let encrypted = encrypt(plaintext, &key).unwrap();
            assert_eq!(decrypt(&encrypted, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_output_layout_is_iv_then_padded_blocks() {
        let key = test_key(b'b');
        let encrypted = encrypt(b"0123456789", &key).unwrap();
        assert_eq!(encrypted.len(), IV_LEN + BLOCK_LEN);

        // full block of plaintext gets a full block of padding
        let encrypted = encrypt(&[7u8; 16], &key).unwrap();
        assert_eq!(encrypted.len(), IV_LEN + 2 * BLOCK_LEN);
    }

    #[test]
    fn test_iv_is_fresh_per_call() {
        let key = test_key(b'c');
        let a = encrypt(b"same", &key).unwrap();
        let b = encrypt(b"same", &key).unwrap();
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_key_length_fails() {
        let result = encrypt(b"data", &[0u8; 32]);
        assert!(matches!(
            result,
            Err(VaultError::InvalidKeyLength {
                expected: 64,
                actual: 32
            })
        ));

        let result = decrypt(&[0u8; 32], &[0u8; 65]);
        assert!(matches!(result, Err(VaultError::InvalidKeyLength { .. })));
    }

    #[test]
    fn test_tampered_padding_fails() {
        let key = test_key(b'd');
        let mut encrypted = encrypt(b"short", &key).unwrap();

        // flipping the IV's last byte flips the single block's padding byte
        encrypted[IV_LEN - 1] ^= 0xFF;

        assert!(matches!(decrypt(&encrypted, &key), Err(VaultError::Decryption)));
    }

    #[test]
    fn test_truncated_blob_fails() {
        let key = test_key(b'e');
        let encrypted = encrypt(b"some secret value", &key).unwrap();

        assert!(matches!(
            decrypt(&encrypted[..encrypted.len() - 1], &key),
            Err(VaultError::Decryption)
        ));
        assert!(matches!(
            decrypt(&encrypted[..IV_LEN], &key),
            Err(VaultError::Decryption)
        ));
    }

    #[test]
    fn test_wrong_key_does_not_return_plaintext() {
        let encrypted = encrypt(b"secret", &test_key(b'f')).unwrap();
        match decrypt(&encrypted, &test_key(b'g')) {
            Err(VaultError::Decryption) => {}
            Ok(garbage) => assert_ne!(garbage, b"secret"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
