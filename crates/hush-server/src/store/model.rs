use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::envelope::{NONCE_LEN, SALT_LEN};

pub const MIN_VIEWS: u8 = 1;
pub const MAX_VIEWS: u8 = 5;
pub const MIN_TTL_SECS: u64 = 900;
/// 90 days.
pub const MAX_TTL_SECS: u64 = 7_776_000;

const ID_BYTES: usize = 16;
const BURN_TOKEN_BYTES: usize = 32;
const ACCESS_TOKEN_BYTES: usize = 16;

/// Length of an encoded secret id.
pub const ID_LEN: usize = 22;

/// Stored as a format byte followed by bincode.
///
/// Everything here is either opaque ciphertext or lifecycle metadata; the
/// server holds no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    /// ChaCha20Poly1305 ciphertext (value + tag), produced client-side.
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
    /// Present iff the content key is passphrase-wrapped.
    pub salt: Option<[u8; SALT_LEN]>,
    pub passphrase_protected: bool,
    pub remaining_views: u8,
    pub burn_token: String,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    /// Unix timestamp (seconds) from which the record is treated as absent.
    pub expires_at: i64,
    pub last_access_at: Option<i64>,
    pub last_access_token: Option<String>,
    /// Bumped on every write; compare-and-swap guard.
    pub revision: u64,
}

impl SecretRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Readable: not expired and views left.
    pub fn is_available(&self, now: i64) -> bool {
        !self.is_expired(now) && self.remaining_views > 0
    }

    /// True when `token` repeats the last effective read within `window` seconds.
    pub fn is_repeat_access(&self, token: &str, now: i64, window: i64) -> bool {
        match (&self.last_access_token, self.last_access_at) {
            (Some(last), Some(at)) => {
                let elapsed = now - at;
                constant_time_eq::constant_time_eq(last.as_bytes(), token.as_bytes())
                    && (0..window).contains(&elapsed)
            }
            _ => false,
        }
    }
}

/// A validated create request, before id and burn token are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSecret {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
    pub salt: Option<[u8; SALT_LEN]>,
    pub passphrase_protected: bool,
    pub ttl_secs: u64,
    pub max_views: u8,
}

impl NewSecret {
    pub(crate) fn into_record(self, id: String, burn_token: String, now: i64) -> SecretRecord {
        SecretRecord {
            id,
            ciphertext: self.ciphertext,
            iv: self.iv,
            salt: self.salt,
            passphrase_protected: self.passphrase_protected,
            remaining_views: self.max_views,
            burn_token,
            created_at: now,
            expires_at: now + self.ttl_secs as i64,
            last_access_at: None,
            last_access_token: None,
            revision: 0,
        }
    }
}

/// Returned to the creator once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub id: String,
    pub burn_token: String,
    pub expires_at: i64,
}

/// Returned to a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
    pub salt: Option<[u8; SALT_LEN]>,
    pub passphrase_protected: bool,
    /// Present this on a retry within the idempotency window.
    pub access_token: String,
    pub remaining_views: u8,
}

impl Retrieved {
    pub(crate) fn from_record(record: &SecretRecord, access_token: String) -> Self {
        Self {
            ciphertext: record.ciphertext.clone(),
            iv: record.iv,
            salt: record.salt,
            passphrase_protected: record.passphrase_protected,
            access_token,
            remaining_views: record.remaining_views,
        }
    }
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// 128-bit base64url secret id.
pub fn generate_id() -> String {
    random_token(ID_BYTES)
}

pub fn generate_burn_token() -> String {
    random_token(BURN_TOKEN_BYTES)
}

pub fn generate_access_token() -> String {
    random_token(ACCESS_TOKEN_BYTES)
}

/// Shape check only; says nothing about existence.
pub fn is_well_formed_id(id: &str) -> bool {
    id.len() == ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(remaining_views: u8, expires_at: i64) -> SecretRecord {
        NewSecret {
            ciphertext: vec![1, 2, 3],
            iv: [0u8; NONCE_LEN],
            salt: None,
            passphrase_protected: false,
            ttl_secs: 0,
            max_views: remaining_views,
        }
        .into_record("id".into(), "burn".into(), expires_at)
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let r = make_record(1, 1000);
        assert!(!r.is_expired(999));
        assert!(r.is_expired(1000));
        assert!(r.is_expired(1001));
    }

    #[test]
    fn unavailable_when_expired_or_exhausted() {
        assert!(make_record(1, 1000).is_available(999));
        assert!(!make_record(0, 1000).is_available(999));
        assert!(!make_record(3, 1000).is_available(1000));
    }

    #[test]
    fn repeat_access_respects_token_and_window() {
        let mut r = make_record(2, 10_000);
        assert!(!r.is_repeat_access("tok", 100, 30));

        r.last_access_token = Some("tok".into());
        r.last_access_at = Some(100);
        assert!(r.is_repeat_access("tok", 100, 30));
        assert!(r.is_repeat_access("tok", 129, 30));
        assert!(!r.is_repeat_access("tok", 130, 30));
        assert!(!r.is_repeat_access("other", 110, 30));
        // A clock that went backwards is not a repeat.
        assert!(!r.is_repeat_access("tok", 99, 30));
    }

    #[test]
    fn generated_ids_are_well_formed_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert!(is_well_formed_id(&a));
        assert_ne!(a, b);
        assert_eq!(generate_burn_token().len(), 43);
        assert_eq!(generate_access_token().len(), 22);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(!is_well_formed_id(""));
        assert!(!is_well_formed_id("short"));
        assert!(!is_well_formed_id("AAAAAAAAAAAAAAAAAAAAA/"));
        assert!(!is_well_formed_id("AAAAAAAAAAAAAAAAAAAAAAA"));
    }
}
