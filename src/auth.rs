//! Join-token verification.
//!
//! The web application signs an HS256 JWT at login; clients present that
//! same token in the `join` handshake. The relay shares the signing secret
//! and verifies locally, so binding a connection to a user id never needs a
//! network round trip — and a bare numeric id is never trusted on its own.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::protocol::UserId;

/// Claims carried by the web application's auth token.
/// The token also carries profile fields the relay has no use for; serde
/// ignores them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    pub exp: i64,
}

/// Why a join handshake was refused.
#[derive(Debug)]
pub enum JoinError {
    /// Signature, structure, or expiry check failed.
    InvalidToken(jsonwebtoken::errors::Error),
    /// The token is genuine but names a different user than the handshake.
    UserMismatch { token_user: UserId, claimed: UserId },
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::InvalidToken(e) => write!(f, "invalid auth token: {}", e),
            JoinError::UserMismatch { claimed, .. } => {
                write!(f, "token does not authorize user {}", claimed)
            }
        }
    }
}

impl std::error::Error for JoinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JoinError::InvalidToken(e) => Some(e),
            JoinError::UserMismatch { .. } => None,
        }
    }
}

/// Verify a join token and check that it names the claimed user id.
pub fn authorize_join(secret: &[u8], token: &str, claimed: UserId) -> Result<Claims, JoinError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::default(),
    )
    .map_err(JoinError::InvalidToken)?;

    let claims = data.claims;
    if claims.id != claimed {
        return Err(JoinError::UserMismatch {
            token_user: claims.id,
            claimed,
        });
    }

    Ok(claims)
}
