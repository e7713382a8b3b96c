//! Bearer token validation for tunnel establishment.
//!
//! Clients authenticate the WebSocket upgrade with a bearer token, carried in
//! an `Authorization: Bearer <token>` header or (for callers that cannot set
//! upgrade headers) a `?token=` query parameter. The validation policy is one
//! of:
//!
//! - **Shared secret** — byte equality against a configured token, compared
//!   in constant time.
//! - **JWT** — signature and expiry verification under a configured secret
//!   and algorithm list. Claims beyond `exp` are not interpreted.

use std::str::FromStr;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use crate::config::AuthConfig;

/// Decides whether a presented bearer token may open a tunnel.
pub enum TokenValidator {
    /// Constant-time equality against a pre-shared secret.
    Static(String),
    /// JWT signature + expiry verification.
    Jwt {
        key: DecodingKey,
        validation: Validation,
    },
}

impl TokenValidator {
    /// Build a validator from the `[auth]` config section. JWT mode wins when
    /// `jwt_secret` is set; otherwise the shared secret is used.
    pub fn from_config(auth: &AuthConfig) -> Result<Self, String> {
        if let Some(secret) = &auth.jwt_secret {
            let mut algorithms = Vec::with_capacity(auth.jwt_algorithms.len());
            for name in &auth.jwt_algorithms {
                algorithms.push(
                    Algorithm::from_str(name)
                        .map_err(|_| format!("unknown JWT algorithm: {name}"))?,
                );
            }
            if algorithms.is_empty() {
                return Err("jwt_algorithms must not be empty".into());
            }
            Ok(Self::jwt(secret, &algorithms))
        } else {
            Ok(Self::Static(auth.client_token.clone()))
        }
    }

    /// JWT validator over an HMAC secret. Only `exp` is required of the
    /// claims; audience and issuer are not checked.
    pub fn jwt(secret: &str, algorithms: &[Algorithm]) -> Self {
        let mut validation = Validation::new(algorithms[0]);
        validation.algorithms = algorithms.to_vec();
        validation.validate_aud = false;
        Self::Jwt {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Whether `token` is acceptable.
    pub fn validate(&self, token: &str) -> bool {
        match self {
            Self::Static(secret) => constant_time_eq(secret.as_bytes(), token.as_bytes()),
            Self::Jwt { key, validation } => {
                jsonwebtoken::decode::<serde_json::Value>(token, key, validation).is_ok()
            }
        }
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot learn the secret's length from
/// response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() { provided[i] } else { 0xff };
        diff |= expected[i] ^ p;
    }
    diff == 0
}
