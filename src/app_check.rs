//! AppCheck tokens: a service-signed assertion exchanged for a short-lived
//! attestation token, cached per app id.

use crate::credential::ServiceAccount;
use crate::error::{Error, Result};
use crate::jwt;
use jwt_simple::prelude::{Claims, Duration};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

pub(crate) const APP_CHECK_BASE: &str = "https://firebaseappcheck.googleapis.com";

const APP_CHECK_AUDIENCE: &str =
    "https://firebaseappcheck.googleapis.com/google.firebase.appcheck.v1.TokenExchangeService";

/// Reuse a cached token while more than a minute of validity remains.
const REFRESH_THRESHOLD_MILLIS: u64 = 60 * 1000;

#[derive(Clone, Debug)]
pub struct AppCheckToken {
    pub token: String,
    pub expiration_time_millis: u64,
}

pub struct AppCheckClient {
    account: ServiceAccount,
    client: reqwest::Client,
    base_url: String,
    cached: Mutex<HashMap<String, AppCheckToken>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AppCheckClaims {
    app_id: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: Option<String>,
    ttl: Option<String>,
}

impl AppCheckClient {
    pub fn new(account: ServiceAccount, client: reqwest::Client) -> Self {
        Self {
            account,
            client,
            base_url: APP_CHECK_BASE.to_string(),
            cached: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub async fn get_token(&self, app_id: &str) -> Result<AppCheckToken> {
        let now = crate::unix_millis();
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.get(app_id) {
            if token.expiration_time_millis.saturating_sub(now) > REFRESH_THRESHOLD_MILLIS {
                return Ok(token.clone());
            }
        }

        let token = self.exchange(app_id, now).await?;
        cached.insert(app_id.to_string(), token.clone());
        Ok(token)
    }

    async fn exchange(&self, app_id: &str, now_millis: u64) -> Result<AppCheckToken> {
        let claims = Claims::with_custom_claims(
            AppCheckClaims {
                app_id: app_id.to_string(),
            },
            Duration::from_mins(5),
        )
        .with_issuer(&self.account.client_email)
        .with_subject(&self.account.client_email)
        .with_audience(APP_CHECK_AUDIENCE);
        let assertion = jwt::sign_claims(claims, &self.account.private_key, None)?;

        let response = self
            .client
            .post(format!(
                "{}/v1/projects/{}/apps/{app_id}:exchangeCustomToken",
                self.base_url, self.account.project_id
            ))
            .json(&serde_json::json!({ "customToken": assertion }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "app check exchange failed ({status}): {body}"
            )));
        }
        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|err| Error::Internal(format!("unparseable app check response: {err}")))?;

        let token = body.token.ok_or_else(|| {
            Error::Internal("app check response is missing the token".to_string())
        })?;
        let ttl_secs = body
            .ttl
            .as_deref()
            .and_then(parse_ttl_seconds)
            .unwrap_or(3600);
        Ok(AppCheckToken {
            token,
            expiration_time_millis: now_millis + ttl_secs * 1000,
        })
    }
}

/// The API returns durations as `"3600s"`.
fn parse_ttl_seconds(ttl: &str) -> Option<u64> {
    ttl.strip_suffix('s')?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::test_key_pem;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn account() -> ServiceAccount {
        ServiceAccount {
            project_id: "p1".to_string(),
            client_email: "sa@p1.iam.gserviceaccount.com".to_string(),
            private_key: test_key_pem().to_string(),
        }
    }

    #[test]
    fn ttl_parsing() {
        assert_eq!(parse_ttl_seconds("3600s"), Some(3600));
        assert_eq!(parse_ttl_seconds("3600"), None);
        assert_eq!(parse_ttl_seconds("s"), None);
    }

    #[tokio::test]
    async fn tokens_are_cached_per_app() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/projects/p1/apps/app-1:exchangeCustomToken",
            post(move |Json(body): Json<serde_json::Value>| {
                let counter = counter.clone();
                async move {
                    assert!(body["customToken"].as_str().is_some());
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "token": "ac-1", "ttl": "3600s" }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let client = AppCheckClient::new(account(), reqwest::Client::new())
            .with_base_url(format!("http://{addr}"));

        let first = client.get_token("app-1").await.expect("minted");
        let second = client.get_token("app-1").await.expect("cached");

        assert_eq!(first.token, "ac-1");
        assert_eq!(second.token, "ac-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
