use crate::api_keys::{API_KEY_PREFIX, ApiKey, ApiKeyStore, KeyRejection};
use crate::bots::Bot;
use crate::error::{AppError, AppResult};
use axum::http::HeaderMap;
use std::collections::HashMap;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_QUERY: &str = "api_key";

/// A validated caller: the key it presented and the bot that key belongs to.
#[derive(Clone, Debug)]
pub struct AuthResult {
    pub api_key: ApiKey,
    pub bot: Bot,
}

impl AuthResult {
    pub fn require_permission(&self, permission: &str) -> AppResult<()> {
        if self.api_key.has_permission(permission) {
            Ok(())
        } else {
            Err(AppError::forbidden(format!(
                "api key lacks the '{permission}' permission"
            )))
        }
    }
}

/// Pulls the caller's credential from, in order: `Authorization: Bearer ak_...`,
/// the `X-API-Key` header, the `api_key` query parameter. The first present source
/// wins; a bearer token without the key prefix is ignored.
pub fn extract_credential(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| token.starts_with(API_KEY_PREFIX));
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    let header = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = header {
        return Some(token.to_string());
    }

    query
        .get(API_KEY_QUERY)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Clone)]
pub struct AuthState {
    api_keys: ApiKeyStore,
}

impl AuthState {
    pub fn new(api_keys: ApiKeyStore) -> Self {
        Self { api_keys }
    }

    /// Validates the request's credential and records one use of it.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> AppResult<AuthResult> {
        let token = extract_credential(headers, query).ok_or_else(|| {
            metrics::counter!("botrelay_key_validations_total", "outcome" => "missing")
                .increment(1);
            AppError::unauthorized("missing api key")
        })?;

        match self.api_keys.validate(&token).await {
            Ok(validated) => {
                metrics::counter!("botrelay_key_validations_total", "outcome" => "ok").increment(1);
                tracing::debug!(
                    api_key_id = %validated.key.id,
                    bot_id = %validated.bot.id,
                    usage_count = validated.key.usage_count,
                    "api key accepted"
                );
                Ok(AuthResult {
                    api_key: validated.key,
                    bot: validated.bot,
                })
            }
            Err(KeyRejection::Storage(err)) => {
                metrics::counter!("botrelay_key_validations_total", "outcome" => "error")
                    .increment(1);
                Err(AppError::internal(err))
            }
            Err(rejection) => {
                metrics::counter!("botrelay_key_validations_total", "outcome" => rejection.as_str())
                    .increment(1);
                tracing::debug!(reason = rejection.as_str(), "api key rejected");
                Err(AppError::unauthorized(rejection.message()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn bearer_wins_over_header_and_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer ak_bearer"));
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("ak_header"));
        let q = query(&[(API_KEY_QUERY, "ak_query")]);
        assert_eq!(extract_credential(&headers, &q).as_deref(), Some("ak_bearer"));
    }

    #[test]
    fn bearer_without_key_prefix_falls_through() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer brs_session"));
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("ak_header"));
        assert_eq!(
            extract_credential(&headers, &HashMap::new()).as_deref(),
            Some("ak_header")
        );

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer brs_session"));
        let q = query(&[(API_KEY_QUERY, "ak_query")]);
        assert_eq!(extract_credential(&headers, &q).as_deref(), Some("ak_query"));
    }

    #[test]
    fn nothing_presented_is_none() {
        assert_eq!(extract_credential(&HeaderMap::new(), &HashMap::new()), None);
        let q = query(&[(API_KEY_QUERY, "  ")]);
        assert_eq!(extract_credential(&HeaderMap::new(), &q), None);
    }
}
