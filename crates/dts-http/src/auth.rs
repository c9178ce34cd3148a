use crate::AppState;
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dts_core::{DtsError, Result, federation::is_orcid};
use serde::Deserialize;
use tracing::warn;

/// Authenticated caller identity attached to request extensions
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub orcid: String,
    pub name: Option<String>,
}

/// Validates a decoded access token and resolves the caller's ORCID
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<AuthUser>;
}

/// Exchanges the access token with an identity provider over HTTP.
/// The provider is expected to answer a bearer-authenticated GET with
/// `{"orcid": "...", "name": "..."}`.
pub struct ProviderAuthenticator {
    url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ProviderIdentity {
    orcid: String,
    #[serde(default)]
    name: Option<String>,
}

impl ProviderAuthenticator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Authenticator for ProviderAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<AuthUser> {
        let response = self
            .http
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DtsError::Auth(format!("identity provider unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(DtsError::Auth(format!(
                "identity provider rejected token: HTTP {}",
                response.status()
            )));
        }

        let identity = response
            .json::<ProviderIdentity>()
            .await
            .map_err(|e| DtsError::Auth(format!("malformed identity response: {e}")))?;
        if !is_orcid(&identity.orcid) {
            return Err(DtsError::Auth(format!(
                "identity provider returned malformed ORCID '{}'",
                identity.orcid
            )));
        }
        Ok(AuthUser {
            orcid: identity.orcid,
            name: identity.name,
        })
    }
}

/// Development-mode authenticator: the decoded token must itself be a
/// well-formed ORCID. Enabled only via `service.debug`.
pub struct DebugAuthenticator;

#[async_trait]
impl Authenticator for DebugAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<AuthUser> {
        if is_orcid(token) {
            Ok(AuthUser {
                orcid: token.to_string(),
                name: None,
            })
        } else {
            Err(DtsError::Auth("token is not an ORCID".into()))
        }
    }
}

/// Bearer-token middleware: `Authorization: Bearer <base64(access_token)>`.
/// Failures answer 401 and never touch the task engine.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if let Some(value) = header {
        if let Some(encoded) = value.strip_prefix("Bearer ") {
            if let Some(token) = decode_token(encoded) {
                match state.authenticator.authenticate(&token).await {
                    Ok(user) => {
                        request.extensions_mut().insert(user);
                        return Ok(next.run(request).await);
                    }
                    Err(e) => warn!("Authentication failed: {}", e),
                }
            } else {
                warn!("Authorization header is not base64");
            }
        }
    }

    Err(StatusCode::UNAUTHORIZED)
}

fn decode_token(encoded: &str) -> Option<String> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    let token = String::from_utf8(bytes).ok()?;
    let token = token.trim().to_string();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_debug_authenticator_accepts_orcid_tokens() {
        let user = DebugAuthenticator
            .authenticate("0000-0000-1234-0000")
            .await
            .unwrap();
        assert_eq!(user.orcid, "0000-0000-1234-0000");

        assert!(DebugAuthenticator.authenticate("not-an-orcid").await.is_err());
    }

    #[test]
    fn test_decode_token() {
        let encoded = BASE64.encode("0000-0000-1234-0000");
        assert_eq!(
            decode_token(&encoded).as_deref(),
            Some("0000-0000-1234-0000")
        );
        assert!(decode_token("!!!not base64!!!").is_none());
        assert!(decode_token(&BASE64.encode("")).is_none());
    }
}
