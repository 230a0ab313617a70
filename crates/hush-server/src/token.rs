//! Capability tokens gating secret creation.
//!
//! A token is an HS256-signed JWT binding a fresh nonce to a proof-of-work
//! challenge for one `create` call. It is stateless: the server keeps nothing
//! between issue and validate. Reuse before expiry is stopped separately by the
//! consumed-nonce ledger in the store.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use zeroize::ZeroizeOnDrop;

use crate::clock::Clock;
use crate::pow::Challenge;

type HmacSha256 = Hmac<Sha256>;

pub const OPERATION_CREATE: &str = "create";
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 300;
pub const SIGNING_KEY_LEN: usize = 32;

const NONCE_BYTES: usize = 16;
const PREFIX_BYTES: usize = 8;

// ── Signing key ──────────────────────────────────────────────────────────────

/// Server-held HMAC key.
#[derive(ZeroizeOnDrop)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SIGNING_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Load raw key bytes as persisted in the key file.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == SIGNING_KEY_LEN).then(|| Self(bytes.to_vec()))
    }

    /// Use an operator-supplied secret string as the key.
    pub fn from_secret(secret: &str) -> Self {
        Self(secret.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn mac(&self) -> Result<HmacSha256, hmac::digest::InvalidLength> {
        HmacSha256::new_from_slice(&self.0)
    }
}

// ── Claims ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub nonce: String,
    pub difficulty: u8,
    pub prefix: String,
    pub iat: i64,
    pub exp: i64,
    pub op: String,
}

impl Claims {
    pub fn challenge(&self) -> Challenge {
        Challenge {
            difficulty: self.difficulty,
            prefix: self.prefix.clone(),
        }
    }
}

/// Wire form of [`Claims`]; every field is checked for presence.
#[derive(Deserialize)]
struct RawClaims {
    nonce: Option<String>,
    difficulty: Option<u8>,
    prefix: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
    op: Option<String>,
}

impl RawClaims {
    fn into_claims(self) -> Result<Claims, TokenError> {
        Ok(Claims {
            nonce: self.nonce.ok_or(TokenError::MissingClaim("nonce"))?,
            difficulty: self.difficulty.ok_or(TokenError::MissingClaim("difficulty"))?,
            prefix: self.prefix.ok_or(TokenError::MissingClaim("prefix"))?,
            iat: self.iat.ok_or(TokenError::MissingClaim("iat"))?,
            exp: self.exp.ok_or(TokenError::MissingClaim("exp"))?,
            op: self.op.ok_or(TokenError::MissingClaim("op"))?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token is missing the `{0}` claim")]
    MissingClaim(&'static str),
    #[error("token expired")]
    Expired,
    #[error("token is not valid for this operation")]
    WrongOperation,
}

/// Result of [`TokenIssuer::issue`].
#[derive(Debug, Clone)]
pub struct Issued {
    pub token: String,
    pub nonce: String,
    pub challenge: Challenge,
    pub expires_at: i64,
}

// ── Adaptive difficulty ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifficultyPolicy {
    /// Difficulty in bits when the server is quiet.
    pub base: u8,
    pub max: u8,
    /// Issuances inside one window that add one bit.
    pub step_every: u32,
    pub window_secs: i64,
}

impl Default for DifficultyPolicy {
    fn default() -> Self {
        Self {
            base: 16,
            max: 22,
            step_every: 50,
            window_secs: 60,
        }
    }
}

#[derive(Debug)]
struct Window {
    started_at: i64,
    issued: u32,
}

/// Raises the challenge difficulty while issuance is busy.
#[derive(Debug)]
pub struct DifficultyGovernor {
    policy: DifficultyPolicy,
    window: Mutex<Window>,
}

impl DifficultyGovernor {
    pub fn new(policy: DifficultyPolicy) -> Self {
        Self {
            policy,
            window: Mutex::new(Window {
                started_at: 0,
                issued: 0,
            }),
        }
    }

    /// Count one issuance at `now` and return the difficulty for it.
    pub fn next(&self, now: i64) -> u8 {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if now.saturating_sub(window.started_at) >= self.policy.window_secs {
            window.started_at = now;
            window.issued = 0;
        }
        window.issued = window.issued.saturating_add(1);

        let extra = (window.issued - 1) / self.policy.step_every.max(1);
        let extra = u8::try_from(extra).unwrap_or(u8::MAX);
        self.policy.base.saturating_add(extra).min(self.policy.max)
    }
}

// ── Issuer ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TokenIssuer {
    key: Arc<SigningKey>,
    clock: Arc<dyn Clock>,
    governor: Arc<DifficultyGovernor>,
    ttl_secs: i64,
}

impl TokenIssuer {
    pub fn new(key: SigningKey, policy: DifficultyPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            key: Arc::new(key),
            clock,
            governor: Arc::new(DifficultyGovernor::new(policy)),
            ttl_secs: DEFAULT_TOKEN_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Mint a nonce and a challenge, and sign them together.
    pub fn issue(&self) -> Result<Issued> {
        let now = self.clock.now();

        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        let mut prefix = [0u8; PREFIX_BYTES];
        OsRng.fill_bytes(&mut prefix);

        let claims = Claims {
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            difficulty: self.governor.next(now),
            prefix: hex::encode(prefix),
            iat: now,
            exp: now + self.ttl_secs,
            op: OPERATION_CREATE.to_owned(),
        };
        let token = self.sign(&claims)?;
        debug!(difficulty = claims.difficulty, "issued capability token");

        Ok(Issued {
            token,
            challenge: claims.challenge(),
            nonce: claims.nonce,
            expires_at: claims.exp,
        })
    }

    /// Check signature, claims, expiry and operation.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.trim().split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let header: Header = decode_segment(header_b64)?;
        if header.alg != "HS256" || !header.typ.eq_ignore_ascii_case("JWT") {
            return Err(TokenError::Malformed);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.key.mac().map_err(|_| TokenError::BadSignature)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims = decode_segment::<RawClaims>(claims_b64)?.into_claims()?;
        if self.clock.now() >= claims.exp {
            return Err(TokenError::Expired);
        }
        if claims.op != OPERATION_CREATE {
            return Err(TokenError::WrongOperation);
        }
        Ok(claims)
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let header = Header {
            alg: "HS256".into(),
            typ: "JWT".into(),
        };
        let header_json = serde_json::to_vec(&header).context("serialize token header")?;
        let claims_json = serde_json::to_vec(claims).context("serialize token claims")?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );
        let mut mac = self
            .key
            .mac()
            .map_err(|e| anyhow::anyhow!("initialise token MAC: {e}"))?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)
}
