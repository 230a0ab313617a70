use crate::envelope::{decode_field, MAX_PLAINTEXT_LEN, NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::response::ApiError;
use crate::store::model::{MAX_TTL_SECS, MAX_VIEWS, MIN_TTL_SECS, MIN_VIEWS};
use crate::store::NewSecret;
use crate::wire::CreateRequest;

/// Base64 length of the largest allowed ciphertext (plaintext limit + tag).
pub const MAX_CIPHERTEXT_B64_LEN: usize = (MAX_PLAINTEXT_LEN + TAG_LEN).div_ceil(3) * 4;

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError::Validation(message.into())
}

/// Check every client-supplied field of a create request.
/// Messages name the field, never its content.
pub fn new_secret(req: CreateRequest) -> Result<NewSecret, ApiError> {
    if !(MIN_TTL_SECS..=MAX_TTL_SECS).contains(&req.ttl) {
        return Err(invalid(format!(
            "ttl must be between {MIN_TTL_SECS} and {MAX_TTL_SECS} seconds"
        )));
    }
    if !(MIN_VIEWS..=MAX_VIEWS).contains(&req.max_views) {
        return Err(invalid(format!(
            "maxViews must be between {MIN_VIEWS} and {MAX_VIEWS}"
        )));
    }

    if req.ciphertext.len() > MAX_CIPHERTEXT_B64_LEN {
        return Err(invalid("ciphertext is too large"));
    }
    let ciphertext =
        decode_field(&req.ciphertext).ok_or_else(|| invalid("ciphertext is not valid base64"))?;
    if ciphertext.len() < TAG_LEN {
        return Err(invalid("ciphertext is too short"));
    }

    let iv: [u8; NONCE_LEN] = decode_field(&req.iv)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| invalid(format!("iv must be {NONCE_LEN} base64-encoded bytes")))?;

    let salt = match &req.salt {
        Some(s) => Some(
            decode_field(s)
                .and_then(|b| <[u8; SALT_LEN]>::try_from(b).ok())
                .ok_or_else(|| invalid(format!("salt must be {SALT_LEN} base64-encoded bytes")))?,
        ),
        None => None,
    };
    if salt.is_some() != req.passphrase_protected {
        return Err(invalid("salt must be present exactly when passphraseProtected is set"));
    }

    Ok(NewSecret {
        ciphertext,
        iv,
        salt,
        passphrase_protected: req.passphrase_protected,
        ttl_secs: req.ttl,
        max_views: req.max_views,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::encode_field;

    fn valid() -> CreateRequest {
        CreateRequest {
            ciphertext: encode_field(&[1u8; 40]),
            iv: encode_field(&[2u8; NONCE_LEN]),
            salt: None,
            nonce: "n".into(),
            pow_solution: 0,
            ttl: 3600,
            max_views: 1,
            passphrase_protected: false,
        }
    }

    fn message(err: ApiError) -> String {
        match err {
            ApiError::Validation(m) => m,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn limit_matches_plaintext_cap() {
        assert_eq!(MAX_CIPHERTEXT_B64_LEN, 68_288);
    }

    #[test]
    fn accepts_valid_request() {
        let secret = new_secret(valid()).unwrap();
        assert_eq!(secret.ciphertext, vec![1u8; 40]);
        assert_eq!(secret.ttl_secs, 3600);
        assert_eq!(secret.max_views, 1);
    }

    #[test]
    fn accepts_boundaries() {
        let mut req = valid();
        req.ttl = MIN_TTL_SECS;
        req.max_views = MAX_VIEWS;
        assert!(new_secret(req).is_ok());

        let mut req = valid();
        req.ttl = MAX_TTL_SECS;
        req.ciphertext = encode_field(&vec![0u8; MAX_PLAINTEXT_LEN + TAG_LEN]);
        assert!(new_secret(req).is_ok());
    }

    #[test]
    fn rejects_out_of_range_ttl_and_views() {
        for ttl in [0, MIN_TTL_SECS - 1, MAX_TTL_SECS + 1] {
            let req = CreateRequest { ttl, ..valid() };
            assert!(message(new_secret(req).unwrap_err()).contains("ttl"));
        }
        for max_views in [0, MAX_VIEWS + 1] {
            let req = CreateRequest { max_views, ..valid() };
            assert!(message(new_secret(req).unwrap_err()).contains("maxViews"));
        }
    }

    #[test]
    fn rejects_bad_ciphertext() {
        let oversized = encode_field(&vec![0u8; MAX_PLAINTEXT_LEN + TAG_LEN + 1]);
        for ciphertext in [oversized, "%%%".into(), encode_field(&[0u8; 15])] {
            let req = CreateRequest { ciphertext, ..valid() };
            assert!(new_secret(req).is_err());
        }
    }

    #[test]
    fn rejects_wrong_iv_and_salt_sizes() {
        let req = CreateRequest {
            iv: encode_field(&[0u8; 16]),
            ..valid()
        };
        assert!(message(new_secret(req).unwrap_err()).contains("iv"));

        let req = CreateRequest {
            salt: Some(encode_field(&[0u8; 8])),
            passphrase_protected: true,
            ..valid()
        };
        assert!(message(new_secret(req).unwrap_err()).contains("salt"));
    }

    #[test]
    fn salt_and_flag_must_agree() {
        let req = CreateRequest {
            salt: Some(encode_field(&[0u8; SALT_LEN])),
            ..valid()
        };
        assert!(new_secret(req).is_err());

        let req = CreateRequest {
            passphrase_protected: true,
            ..valid()
        };
        assert!(new_secret(req).is_err());

        let req = CreateRequest {
            salt: Some(encode_field(&[0u8; SALT_LEN])),
            passphrase_protected: true,
            ..valid()
        };
        assert!(new_secret(req).unwrap().salt.is_some());
    }
}
