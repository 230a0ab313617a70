//! Client-side envelope encryption.
//!
//! A random content key seals the plaintext with ChaCha20-Poly1305. The key
//! itself travels in the URL fragment, either raw or wrapped under a
//! PBKDF2-derived key when the sender sets a passphrase. The server only ever
//! stores the sealed payload.

use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const MAX_PLAINTEXT_LEN: usize = 50 * 1024;

/// wrapping nonce || wrapped content key || tag
const WRAPPED_FRAGMENT_LEN: usize = NONCE_LEN + KEY_LEN + TAG_LEN;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("plaintext exceeds {} bytes", MAX_PLAINTEXT_LEN)]
    PlaintextTooLarge,
    #[error("this secret is protected by a passphrase")]
    PassphraseRequired,
    /// Wrong key, wrong passphrase, or tampered data.
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("malformed share link")]
    MalformedLink,
}

/// 256-bit symmetric key, wiped on drop.
#[derive(ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    fn random() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| EnvelopeError::DecryptionFailed)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq::constant_time_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// What gets uploaded: everything except the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// ChaCha20Poly1305 ciphertext (plaintext + tag).
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
    /// Present iff the content key is passphrase-wrapped.
    pub salt: Option<[u8; SALT_LEN]>,
}

impl Payload {
    pub fn is_passphrase_protected(&self) -> bool {
        self.salt.is_some()
    }
}

/// Output of [`encrypt_secret`].
#[derive(Debug)]
pub struct Sealed {
    pub payload: Payload,
    /// base64url key material for the URL fragment. Never sent to the server.
    pub fragment: String,
}

/// Derive a wrapping key from `passphrase` and `salt` with PBKDF2-HMAC-SHA256.
pub fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN]) -> SymmetricKey {
    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    let key = SymmetricKey(out);
    out.zeroize();
    key
}

fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), EnvelopeError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| EnvelopeError::EncryptionFailed)?;

    Ok((nonce_bytes, ciphertext))
}

fn open(
    key: &SymmetricKey,
    nonce_bytes: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| EnvelopeError::DecryptionFailed)
}

/// Encrypt `plaintext` under a fresh content key.
///
/// With a passphrase the content key is wrapped under `derive_key(passphrase,
/// salt)` and the fragment carries `wrapping nonce || wrapped key`; the salt
/// goes into the payload so the recipient can re-derive.
pub fn encrypt_secret(plaintext: &str, passphrase: Option<&str>) -> Result<Sealed, EnvelopeError> {
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(EnvelopeError::PlaintextTooLarge);
    }

    let content_key = SymmetricKey::random();
    let (iv, ciphertext) = seal(&content_key, plaintext.as_bytes())?;

    let (salt, fragment) = match passphrase {
        None => (None, URL_SAFE_NO_PAD.encode(content_key.as_bytes())),
        Some(passphrase) => {
            let mut salt = [0u8; SALT_LEN];
            OsRng.fill_bytes(&mut salt);

            let wrapping_key = derive_key(passphrase, &salt);
            let (wrap_nonce, wrapped) = seal(&wrapping_key, content_key.as_bytes())?;

            let mut raw = Zeroizing::new(Vec::with_capacity(WRAPPED_FRAGMENT_LEN));
            raw.extend_from_slice(&wrap_nonce);
            raw.extend_from_slice(&wrapped);
            (Some(salt), URL_SAFE_NO_PAD.encode(raw.as_slice()))
        }
    };

    Ok(Sealed {
        payload: Payload {
            ciphertext,
            iv,
            salt,
        },
        fragment,
    })
}

/// Recover the plaintext from `payload` using the key material in `fragment`.
pub fn decrypt_secret(
    payload: &Payload,
    fragment: &str,
    passphrase: Option<&str>,
) -> Result<String, EnvelopeError> {
    let raw = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(fragment.trim_start_matches('#'))
            .map_err(|_| EnvelopeError::DecryptionFailed)?,
    );

    let content_key = match payload.salt {
        None => SymmetricKey::from_slice(&raw)?,
        Some(salt) => {
            let passphrase = passphrase.ok_or(EnvelopeError::PassphraseRequired)?;
            if raw.len() != WRAPPED_FRAGMENT_LEN {
                return Err(EnvelopeError::DecryptionFailed);
            }
            let (nonce, wrapped) = raw.split_at(NONCE_LEN);
            let nonce: [u8; NONCE_LEN] = nonce
                .try_into()
                .map_err(|_| EnvelopeError::DecryptionFailed)?;

            let wrapping_key = derive_key(passphrase, &salt);
            let unwrapped = Zeroizing::new(open(&wrapping_key, &nonce, wrapped)?);
            SymmetricKey::from_slice(&unwrapped)?
        }
    };

    let plaintext = open(&content_key, &payload.iv, &payload.ciphertext)?;
    String::from_utf8(plaintext).map_err(|_| EnvelopeError::DecryptionFailed)
}

/// Standard padded base64, the encoding of payload fields on the wire.
pub fn encode_field(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_field(field: &str) -> Option<Vec<u8>> {
    STANDARD.decode(field).ok()
}

// ── Share links ──────────────────────────────────────────────────────────────

/// `{base}/s/{id}#{fragment}`. Only `base` and `id` ever reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLink {
    pub base: Url,
    pub id: String,
    pub fragment: String,
}

impl ShareLink {
    pub fn new(base: Url, id: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            base,
            id: id.into(),
            fragment: fragment.into(),
        }
    }

    pub fn parse(link: &str) -> Result<Self, EnvelopeError> {
        let url = Url::parse(link).map_err(|_| EnvelopeError::MalformedLink)?;

        let fragment = url
            .fragment()
            .filter(|f| !f.is_empty())
            .ok_or(EnvelopeError::MalformedLink)?
            .to_owned();

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let [prefix @ .., "s", id] = segments.as_slice() else {
            return Err(EnvelopeError::MalformedLink);
        };
        let id = (*id).to_owned();
        let base_path = prefix.join("/");

        let mut base = url.clone();
        base.set_fragment(None);
        base.set_query(None);
        base.set_path(&base_path);

        Ok(Self { base, id, fragment })
    }
}

impl fmt::Display for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/s/{}#{}",
            self.base.as_str().trim_end_matches('/'),
            self.id,
            self.fragment
        )
    }
}
