//! Bearer-token authentication with HS256 JWTs.

use anyhow::{anyhow, Result};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::settings::SecurityConfig;

pub const ANONYMOUS_USER: &str = "anonymous";

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (user ID)
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Claims {
    fn anonymous() -> Self {
        Self {
            sub: ANONYMOUS_USER.to_string(),
            exp: 0,
            iat: 0,
            iss: String::new(),
            roles: Vec::new(),
        }
    }
}

/// Issues and validates tokens; with authentication disabled every request
/// runs as the anonymous user.
#[derive(Clone)]
pub struct AuthManager {
    enabled: bool,
    jwt_secret: String,
    jwt_expiry_hours: i64,
    issuer: String,
}

impl AuthManager {
    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        let jwt_secret = match (&config.jwt_secret, config.enable_authentication) {
            (Some(secret), _) => secret.clone(),
            (None, false) => String::new(),
            (None, true) => return Err(anyhow!("Authentication enabled but no JWT secret provided")),
        };
        if !config.enable_authentication {
            warn!("Authentication disabled; all requests run as '{}'", ANONYMOUS_USER);
        }
        Ok(Self {
            enabled: config.enable_authentication,
            jwt_secret,
            jwt_expiry_hours: config.jwt_expiry_hours,
            issuer: config.jwt_issuer.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Mint a token for `user_id`.
    pub fn issue_token(&self, user_id: &str) -> Result<String> {
        if self.jwt_secret.is_empty() {
            return Err(anyhow!("Cannot issue tokens without a JWT secret"));
        }
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(self.jwt_expiry_hours);

        let claims = Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp() as usize,
            iat: now.timestamp() as usize,
            iss: self.issuer.clone(),
            roles: vec!["farmer".to_string()],
        };

        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(self.jwt_secret.as_ref());

        let token = encode(&header, &claims, &encoding_key)
            .map_err(|e| anyhow!("Token generation failed: {}", e))?;
        info!("Issued token for user '{}'", user_id);
        Ok(token)
    }

    /// Validate JWT token and extract claims
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoding_key = DecodingKey::from_secret(self.jwt_secret.as_ref());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);

        let token_data = decode::<Claims>(token, &decoding_key, &validation)
            .map_err(|e| anyhow!("Token validation failed: {}", e))?;

        Ok(token_data.claims)
    }
}

/// Extract JWT token from Authorization header
pub fn extract_token(headers: &HeaderMap) -> Result<String> {
    let auth_header = headers
        .get("Authorization")
        .ok_or_else(|| anyhow!("Missing Authorization header"))?
        .to_str()
        .map_err(|_| anyhow!("Invalid Authorization header"))?;

    auth_header
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid Authorization format"))
}

/// Authentication middleware; inserts [`Claims`] for downstream handlers.
pub async fn auth_middleware(
    State(auth_manager): State<Arc<AuthManager>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !auth_manager.is_enabled() {
        request.extensions_mut().insert(Claims::anonymous());
        return Ok(next.run(request).await);
    }

    let token = match extract_token(request.headers()) {
        Ok(token) => token,
        Err(e) => {
            warn!("Unauthorized request to {}: {}", request.uri().path(), e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    match auth_manager.validate_token(&token) {
        Ok(claims) => {
            debug!("Authenticated user '{}'", claims.sub);
            request.extensions_mut().insert(claims);
            Ok(next.run(request).await)
        }
        Err(e) => {
            warn!("Token validation failed: {}", e);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn manager(secret: &str) -> AuthManager {
        AuthManager::from_config(&SecurityConfig {
            jwt_secret: Some(secret.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn issued_tokens_validate() {
        let auth = manager("test_secret");
        let token = auth.issue_token("farmer-42").unwrap();
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "farmer-42");
        assert_eq!(claims.iss, "kisan-advisor");
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let token = manager("one").issue_token("farmer-42").unwrap();
        assert!(manager("two").validate_token(&token).is_err());
    }

    #[test]
    fn enabled_auth_requires_a_secret() {
        assert!(AuthManager::from_config(&SecurityConfig::default()).is_err());
        let disabled = AuthManager::from_config(&SecurityConfig {
            enable_authentication: false,
            ..Default::default()
        })
        .unwrap();
        assert!(!disabled.is_enabled());
        assert!(disabled.issue_token("x").is_err());
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Token abc"));
        assert!(extract_token(&headers).is_err());
        headers.insert("Authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_token(&headers).unwrap(), "abc");
    }
}
