//! JSON bodies exchanged between the server and its clients.

use serde::{Deserialize, Serialize};

use crate::envelope::{decode_field, encode_field, EnvelopeError, Payload, NONCE_LEN, SALT_LEN};
use crate::pow::Challenge;
use crate::store::{Created, Retrieved};
use crate::token::Issued;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub nonce: String,
    pub challenge: Challenge,
    pub expires_at: i64,
}

impl From<Issued> for TokenResponse {
    fn from(issued: Issued) -> Self {
        Self {
            token: issued.token,
            nonce: issued.nonce,
            challenge: issued.challenge,
            expires_at: issued.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    /// Standard base64.
    pub ciphertext: String,
    pub iv: String,
    pub salt: Option<String>,
    pub nonce: String,
    pub pow_solution: u64,
    /// Seconds.
    pub ttl: u64,
    pub max_views: u8,
    #[serde(default)]
    pub passphrase_protected: bool,
}

impl CreateRequest {
    pub fn new(payload: &Payload, nonce: String, pow_solution: u64, ttl: u64, max_views: u8) -> Self {
        Self {
            ciphertext: encode_field(&payload.ciphertext),
            iv: encode_field(&payload.iv),
            salt: payload.salt.as_ref().map(|s| encode_field(s)),
            nonce,
            pow_solution,
            ttl,
            max_views,
            passphrase_protected: payload.is_passphrase_protected(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub id: String,
    pub burn_token: String,
    pub expires_at: i64,
}

impl From<Created> for CreateResponse {
    fn from(created: Created) -> Self {
        Self {
            id: created.id,
            burn_token: created.burn_token,
            expires_at: created.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretResponse {
    pub ciphertext: String,
    pub iv: String,
    pub salt: Option<String>,
    pub passphrase_protected: bool,
    pub access_token: String,
}

impl From<Retrieved> for SecretResponse {
    fn from(r: Retrieved) -> Self {
        Self {
            ciphertext: encode_field(&r.ciphertext),
            iv: encode_field(&r.iv),
            salt: r.salt.as_ref().map(|s| encode_field(s)),
            passphrase_protected: r.passphrase_protected,
            access_token: r.access_token,
        }
    }
}

impl SecretResponse {
    /// Decode the base64 fields back into an envelope payload.
    pub fn payload(&self) -> Result<Payload, EnvelopeError> {
        let ciphertext = decode_field(&self.ciphertext).ok_or(EnvelopeError::DecryptionFailed)?;
        let iv: [u8; NONCE_LEN] = decode_field(&self.iv)
            .and_then(|b| b.try_into().ok())
            .ok_or(EnvelopeError::DecryptionFailed)?;
        let salt = match &self.salt {
            Some(s) => Some(
                decode_field(s)
                    .and_then(|b| <[u8; SALT_LEN]>::try_from(b).ok())
                    .ok_or(EnvelopeError::DecryptionFailed)?,
            ),
            None => None,
        };
        Ok(Payload {
            ciphertext,
            iv,
            salt,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnRequest {
    pub burn_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
