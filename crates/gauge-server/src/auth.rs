use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use gauge_types::{UserRecord, UserRole};

use crate::{ApiError, ApiResult, AppState, AuthMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    ApiKey,
    ProxyHeaders,
    Bootstrap,
    /// Local dev mode; unlocks everything.
    None,
}

#[derive(Debug, Clone)]
pub struct Principal {
    pub user: Option<UserRecord>,
    pub kind: AuthKind,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            user: None,
            kind: AuthKind::None,
        }
    }

    pub fn is_local_dev(&self) -> bool {
        self.kind == AuthKind::None
    }

    pub fn user(&self) -> ApiResult<&UserRecord> {
        self.user
            .as_ref()
            .ok_or_else(|| ApiError::Unauthorized("authenticated user required".to_string()))
    }

    pub fn role(&self) -> Option<UserRole> {
        self.user.as_ref().map(|u| u.role)
    }

    pub fn is_admin(&self) -> bool {
        self.role() == Some(UserRole::Admin)
    }
}

/// First 8 chars of a token; indexed, loggable, not secret.
pub fn token_prefix(token: &str) -> String {
    token.chars().take(8).collect()
}

pub fn hash_api_key(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

fn verify_api_key(token: &str, stored_hash: &[u8]) -> bool {
    let computed = hash_api_key(token);
    if computed.len() != stored_hash.len() {
        return false;
    }
    computed.as_slice().ct_eq(stored_hash).into()
}

/// Freshly minted bearer token for engine traffic.
pub fn new_api_key_token() -> String {
    format!(
        "gk_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Engine auth: bearer API key, prefix-indexed, constant-time hash compare.
pub async fn require_api_key(state: &AppState, headers: &HeaderMap) -> ApiResult<Principal> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer API key".to_string()))?;

    let prefix = token_prefix(&token);
    let Some((key, stored_hash)) = state.store.find_active_api_key(&prefix).await? else {
        return Err(ApiError::Unauthorized("invalid API key".to_string()));
    };
    if !verify_api_key(&token, &stored_hash) {
        return Err(ApiError::Unauthorized("invalid API key".to_string()));
    }

    let user = state
        .store
        .get_user(&key.user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| ApiError::Forbidden("user disabled".to_string()))?;

    Ok(Principal {
        user: Some(user),
        kind: AuthKind::ApiKey,
    })
}

/// UI auth: reverse-proxy identity headers, with first-user bootstrap.
pub async fn require_ui(state: &AppState, headers: &HeaderMap) -> ApiResult<Principal> {
    if state.config.auth_mode == AuthMode::None {
        return Ok(Principal::anonymous());
    }

    let email = header_value(headers, "x-user-email")
        .or_else(|| header_value(headers, "x-email"))
        .map(|e| e.to_lowercase());

    if let Some(email) = &email {
        if let Some(user) = state.store.get_user_by_email(email).await? {
            if user.is_active {
                return Ok(Principal {
                    user: Some(user),
                    kind: AuthKind::ProxyHeaders,
                });
            }
        }
    }

    // Bootstrap the very first user when the table is empty and the caller
    // knows the deployment secret.
    let bootstrap = header_value(headers, "x-admin-bootstrap");
    let token = state.config.admin_bootstrap_token.as_str();
    if !token.is_empty()
        && bootstrap.as_deref() == Some(token)
        && state.store.count_users().await? == 0
    {
        let Some(email) = email else {
            return Err(ApiError::BadRequest(
                "bootstrap requires X-User-Email".to_string(),
            ));
        };
        let user = state
            .store
            .create_user(&email, &email, UserRole::Vp, None)
            .await?;
        return Ok(Principal {
            user: Some(user),
            kind: AuthKind::Bootstrap,
        });
    }

    Err(ApiError::Unauthorized(
        "missing user identity headers".to_string(),
    ))
}

pub fn require_admin(principal: &Principal) -> ApiResult<()> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("admin only".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_takes_first_eight_chars() {
        assert_eq!(token_prefix("gk_abcdefgh123"), "gk_abcde");
        assert_eq!(token_prefix("short"), "short");
    }

    #[test]
    fn verify_rejects_wrong_token() {
        let token = new_api_key_token();
        let hash = hash_api_key(&token);
        assert!(verify_api_key(&token, &hash));
        assert!(!verify_api_key("gk_other", &hash));
        assert!(!verify_api_key(&token, b"short"));
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok-123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok-123"));

        headers.insert("authorization", "Basic tok-123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", "Bearer   ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
