//! The encryption envelope (§4.6). Payload bytes only: `id`, `clientId`,
//! `entityType`, `entityId`, `vectorClock`, `timestamp`, `opType` stay
//! plaintext on [`opsync_core::Operation`] so the server can still route on
//! causality without ever seeing plaintext content.
//!
//! Key derivation is a two-stage pipeline, resolving the open question left
//! by the distilled spec ("the exact KDF parameters and cipher suite are
//! implementation choices; confidentiality and key-derivation slowness are
//! the only requirements"): PBKDF2-HMAC-SHA256 supplies the slow,
//! brute-force-resistant step from the user password, then HKDF-SHA256
//! expands that into the ChaCha20Poly1305 key plus any future subkeys. See
//! DESIGN.md for the full rationale.

use crate::error::{ClientSyncError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const ALGORITHM: &str = "chacha20poly1305-hkdf-sha256-pbkdf2";
const PBKDF2_ITERATIONS: u32 = 210_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"opsync-payload-encryption-v1";

/// The encrypted form of an [`opsync_core::Operation`]'s payload. Stored as
/// the `payload` JSON value when encryption is enabled; opaque to the server
/// and to any downloader that lacks the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionEnvelope {
    pub algorithm: String,
    pub kdf_salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut pbkdf2_out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut pbkdf2_out);

    let hk = Hkdf::<Sha256>::new(Some(salt), &pbkdf2_out);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Encrypts `plaintext` under `password`, generating a fresh random salt and
/// nonce. Never reuses a nonce across calls (unlike the hardcoded-nonce
/// anti-pattern this crate deliberately avoids).
pub fn encrypt_payload(password: &str, plaintext: &[u8]) -> EncryptionEnvelope {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key_bytes = derive_key(password, &salt);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("in-memory ChaCha20Poly1305 encryption does not fail");

    EncryptionEnvelope {
        algorithm: ALGORITHM.to_string(),
        kdf_salt: STANDARD.encode(salt),
        nonce: STANDARD.encode(nonce_bytes),
        ciphertext: STANDARD.encode(ciphertext),
    }
}

/// Decrypts an [`EncryptionEnvelope`]. Returns
/// [`ClientSyncError::Decryption`] for a wrong password or corrupted
/// payload; callers surface this as a visible, sync-halting error per §7,
/// never as a silent data loss.
pub fn decrypt_payload(password: &str, envelope: &EncryptionEnvelope) -> Result<Vec<u8>> {
    if envelope.algorithm != ALGORITHM {
        return Err(ClientSyncError::Decryption);
    }
    let salt = STANDARD
        .decode(&envelope.kdf_salt)
        .map_err(|_| ClientSyncError::Decryption)?;
    let nonce_bytes = STANDARD
        .decode(&envelope.nonce)
        .map_err(|_| ClientSyncError::Decryption)?;
    let ciphertext = STANDARD
        .decode(&envelope.ciphertext)
        .map_err(|_| ClientSyncError::Decryption)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(ClientSyncError::Decryption);
    }

    let key_bytes = derive_key(password, &salt);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| ClientSyncError::Decryption)
}
