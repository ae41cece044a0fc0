//! JWT issuance/validation, modeled as trait abstractions built from a typed
//! configuration variant rather than a runtime type switch (see design note in
//! SPEC_FULL.md §9 / original spec §9).

use std::{path::PathBuf, sync::Arc, time::SystemTime};

use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};

use crate::{
    error::FabricError,
    ids::UserId,
    model::Principal,
};

const TOKEN_DURATION_SECS: u64 = 24 * 60 * 60;
const ISSUER: &str = "fabric-auth";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: UserId,
    username: String,
    iat: u64,
    exp: u64,
    iss: String,
}

pub trait TokenIssuer: Send + Sync {
    fn issue(&self, principal: &Principal) -> Result<String, FabricError>;
}

pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Principal, FabricError>;
}

/// Typed configuration variants for the auth collaborator, mirroring
/// `original_source/pkg/auth/config.go`'s `ValidatorConfiguration`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    /// Accepts any bearer value, fabricating a Principal from it. Local/dev use only.
    Noop,
    JwtRsa {
        public_key_path: PathBuf,
        private_key_path: PathBuf,
    },
}

impl AuthConfig {
    pub fn build_validator(&self) -> Result<Arc<dyn TokenValidator>, FabricError> {
        match self {
            AuthConfig::Noop => Ok(Arc::new(NoopAuth)),
            AuthConfig::JwtRsa { public_key_path, .. } => {
                let pem = std::fs::read(public_key_path).map_err(|e| {
                    FabricError::InvalidConfig(format!("reading JWT public key: {e}"))
                })?;
                let key = DecodingKey::from_rsa_pem(&pem)
                    .map_err(|e| FabricError::InvalidConfig(format!("parsing JWT public key: {e}")))?;
                Ok(Arc::new(JwtRsaValidator { key }))
            }
        }
    }

    pub fn build_issuer(&self) -> Result<Arc<dyn TokenIssuer>, FabricError> {
        match self {
            AuthConfig::Noop => Ok(Arc::new(NoopAuth)),
            AuthConfig::JwtRsa {
                private_key_path, ..
            } => {
                let pem = std::fs::read(private_key_path).map_err(|e| {
                    FabricError::InvalidConfig(format!("reading JWT private key: {e}"))
                })?;
                let key = EncodingKey::from_rsa_pem(&pem).map_err(|e| {
                    FabricError::InvalidConfig(format!("parsing JWT private key: {e}"))
                })?;
                Ok(Arc::new(JwtRsaIssuer { key }))
            }
        }
    }
}

struct JwtRsaIssuer {
    key: EncodingKey,
}

impl TokenIssuer for JwtRsaIssuer {
    fn issue(&self, principal: &Principal) -> Result<String, FabricError> {
        let now = unix_now();
        let claims = Claims {
            sub: principal.user_id,
            username: principal.username.clone(),
            iat: now,
            exp: now + TOKEN_DURATION_SECS,
            iss: ISSUER.to_owned(),
        };

        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &self.key,
        )
        .map_err(|e| FabricError::Internal(format!("signing token: {e}")))
    }
}

struct JwtRsaValidator {
    key: DecodingKey,
}

impl TokenValidator for JwtRsaValidator {
    fn validate(&self, token: &str) -> Result<Principal, FabricError> {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);

        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &validation)
            .map_err(|e| FabricError::Unauthorized(format!("invalid token: {e}")))?;

        Ok(Principal {
            user_id: data.claims.sub,
            username: data.claims.username,
        })
    }
}

/// Accepts any bearer value, fabricating a principal from it. Dev/test configuration only.
struct NoopAuth;

impl TokenValidator for NoopAuth {
    fn validate(&self, token: &str) -> Result<Principal, FabricError> {
        Ok(Principal {
            user_id: UserId::new(),
            username: token.to_owned(),
        })
    }
}

impl TokenIssuer for NoopAuth {
    fn issue(&self, principal: &Principal) -> Result<String, FabricError> {
        Ok(principal.username.clone())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub mod http_middleware {
    use axum::{
        body::Body,
        extract::State,
        http::{header, Request, StatusCode},
        middleware::Next,
        response::Response,
    };
    use std::sync::Arc;

    use super::TokenValidator;
    use crate::model::Principal;

    /// Strips the `Bearer ` prefix, validates the token, and inserts the resulting
    /// `Principal` as a request extension for downstream handlers to extract.
    pub async fn require_auth(
        State(validator): State<Arc<dyn TokenValidator>>,
        mut request: Request<Body>,
        next: Next,
    ) -> Result<Response, StatusCode> {
        let header_value = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let principal: Principal = validator
            .validate(token)
            .map_err(|_| StatusCode::UNAUTHORIZED)?;

        request.extensions_mut().insert(principal);
        Ok(next.run(request).await)
    }
}
