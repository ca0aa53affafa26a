use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::Zeroizing;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the initialization vector prepended to every ciphertext.
pub const IV_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid key or corrupted data")]
    InvalidKeyOrData,
}

fn valid_key_len(len: usize) -> bool {
    matches!(len, 16 | 24 | 32)
}

/// Encrypt a buffer. Payload layout: IV (16 bytes) + AES-CBC-PKCS7 ciphertext.
///
/// A fresh IV is drawn from the OS generator on every call, so encrypting the
/// same plaintext twice never produces the same payload.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if !valid_key_len(key.len()) {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = match key.len() {
        16 => Aes128CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::InvalidKeyOrData)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => Aes192CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::InvalidKeyOrData)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        _ => Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::InvalidKeyOrData)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    };

    let mut payload = iv.to_vec();
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Decrypt a payload produced by [`encrypt`].
///
/// The first 16 bytes are the IV, the rest the ciphertext. A short payload,
/// an invalid key size and a failed padding check all come back as
/// [`CryptoError::InvalidKeyOrData`].
pub fn decrypt(key: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if !valid_key_len(key.len()) || payload.len() < IV_LEN {
        return Err(CryptoError::InvalidKeyOrData);
    }

    let (iv, ciphertext) = payload.split_at(IV_LEN);

    let plaintext = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKeyOrData)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        24 => Aes192CbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKeyOrData)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        _ => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKeyOrData)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
    };

    plaintext.map_err(|_| CryptoError::InvalidKeyOrData)
}

/// Encrypt one record field for the wire: Base64(IV + ciphertext).
///
/// An empty value stays empty, there is nothing worth encrypting.
pub fn encrypt_field(key: &[u8], value: &str) -> Result<String, CryptoError> {
    if value.is_empty() {
        return Ok(String::new());
    }
    let payload = encrypt(key, value.as_bytes())?;
    Ok(BASE64.encode(payload))
}

/// Decrypt one record field coming off the wire.
pub fn decrypt_field(key: &[u8], value: &str) -> Result<String, CryptoError> {
    if value.is_empty() {
        return Ok(String::new());
    }
    let payload = BASE64
        .decode(value)
        .map_err(|_| CryptoError::InvalidKeyOrData)?;
    let plaintext = decrypt(key, &payload)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidKeyOrData)
}

/// Decode a Base64 secret key and validate its length.
pub fn decode_key(key_b64: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let bytes = BASE64
        .decode(key_b64.trim())
        .map_err(|_| CryptoError::InvalidKeyOrData)?;
    if !valid_key_len(bytes.len()) {
        return Err(CryptoError::InvalidKeyLength(bytes.len()));
    }
    Ok(Zeroizing::new(bytes))
}

/// Generate a random 256-bit secret key, Base64 encoded. Used at signup.
pub fn generate_key() -> String {
    let mut key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *key);
    BASE64.encode(&*key)
}
