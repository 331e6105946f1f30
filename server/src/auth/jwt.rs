use std::path::Path;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::store::Identity;

/// Minimum accepted length of the HS256 signing secret.
pub const MIN_SECRET_LEN: usize = 32;

/// Claims of a session token issued by the platform's login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    /// User ID
    pub sub: String,
    pub player_number: i64,
    pub username: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Load the shared HS256 secret used to verify session tokens.
/// Trailing whitespace (a newline left by an editor) is ignored.
pub fn load_jwt_secret(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut key = std::fs::read(path)?;
    while key.last().is_some_and(|b| b.is_ascii_whitespace()) {
        key.pop();
    }
    if key.len() < MIN_SECRET_LEN {
        return Err(format!(
            "JWT secret in {} is {} bytes, need at least {}",
            path.display(),
            key.len(),
            MIN_SECRET_LEN
        )
        .into());
    }
    tracing::info!("JWT secret loaded from {}", path.display());
    Ok(key)
}

/// Issue a session token for `user`, valid for `ttl_secs`.
pub fn issue_session_token(
    secret: &[u8],
    user: &Identity,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: user.user_id.clone(),
        player_number: user.player_number,
        username: user.username.clone(),
        iat: now,
        exp: now + ttl_secs,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Validate a session token and return the identity it carries.
pub fn validate_session_token(
    secret: &[u8],
    token: &str,
) -> Result<Identity, jsonwebtoken::errors::Error> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    let token_data = decode::<SessionClaims>(token, &DecodingKey::from_secret(secret), &validation)?;
    let claims = token_data.claims;
    Ok(Identity {
        user_id: claims.sub,
        player_number: claims.player_number,
        username: claims.username,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn alice() -> Identity {
        Identity {
            user_id: "u-alice".to_string(),
            player_number: 3,
            username: "alice".to_string(),
        }
    }

    #[test]
    fn test_issued_token_validates() {
        let token = issue_session_token(SECRET, &alice(), 900).unwrap();
        assert_eq!(validate_session_token(SECRET, &token).unwrap(), alice());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = issue_session_token(SECRET, &alice(), -600).unwrap();
        let err = validate_session_token(SECRET, &token).unwrap_err();
        assert_eq!(
            *err.kind(),
            jsonwebtoken::errors::ErrorKind::ExpiredSignature
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_session_token(SECRET, &alice(), 900).unwrap();
        assert!(validate_session_token(b"another-secret-another-secret-xx", &token).is_err());
    }

    #[test]
    fn test_load_secret_trims_and_checks_length() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SECRET).unwrap();
        file.write_all(b"\n").unwrap();
        assert_eq!(load_jwt_secret(file.path()).unwrap(), SECRET);

        let mut short = tempfile::NamedTempFile::new().unwrap();
        short.write_all(b"too-short").unwrap();
        assert!(load_jwt_secret(short.path()).is_err());
    }
}
