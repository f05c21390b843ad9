//! Google OAuth2 credentials for service accounts. A self-signed assertion
//! is exchanged for a short-lived access token, cached until it nears
//! expiry.

use crate::error::{Error, Result};
use crate::jwt;
use jwt_simple::prelude::{Claims, Duration};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub(crate) const OAUTH_TOKEN_URL: &str = "https://accounts.google.com/o/oauth2/token";

const SCOPES: [&str; 5] = [
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/firebase.database",
    "https://www.googleapis.com/auth/firebase.messaging",
    "https://www.googleapis.com/auth/identitytoolkit",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// Refresh once fewer than five minutes of validity remain.
const REFRESH_THRESHOLD_MILLIS: u64 = 5 * 60 * 1000;

/// Service account material, loaded once at process init and never mutated.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
}

#[derive(Clone, Debug)]
pub struct AccessToken {
    pub token: String,
    pub expiration_time_millis: u64,
}

impl AccessToken {
    fn needs_refresh(&self, now_millis: u64) -> bool {
        self.expiration_time_millis.saturating_sub(now_millis) <= REFRESH_THRESHOLD_MILLIS
    }
}

/// The credential variants that can mint access tokens. Only service
/// accounts exist today; refresh-token and workload-identity credentials
/// slot in as further variants.
pub enum Credential {
    ServiceAccount(ServiceAccountCredential),
}

impl Credential {
    pub async fn get_access_token(&self, force_refresh: bool) -> Result<AccessToken> {
        match self {
            Credential::ServiceAccount(credential) => credential.get_token(force_refresh).await,
        }
    }
}

pub struct ServiceAccountCredential {
    account: ServiceAccount,
    client: reqwest::Client,
    token_url: String,
    cached: Mutex<Option<AccessToken>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    scope: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

impl ServiceAccountCredential {
    pub fn new(account: ServiceAccount, client: reqwest::Client) -> Self {
        Self {
            account,
            client,
            token_url: OAUTH_TOKEN_URL.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    pub async fn get_token(&self, force_refresh: bool) -> Result<AccessToken> {
        let now = crate::unix_millis();
        let mut cached = self.cached.lock().await;
        if !force_refresh {
            if let Some(token) = cached.as_ref() {
                if !token.needs_refresh(now) {
                    return Ok(token.clone());
                }
            }
        }

        let token = self.fetch_token(now).await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn fetch_token(&self, now_millis: u64) -> Result<AccessToken> {
        let assertion = self.sign_assertion()?;
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, "oauth2 token exchange failed");
            })?;

        let status = response.status();
        let body: TokenResponse = response.json().await.map_err(|err| {
            Error::InvalidCredential(format!("unparseable token response ({status}): {err}"))
        })?;

        if let Some(error) = body.error {
            let description = body.error_description.unwrap_or_default();
            if error == "invalid_grant" {
                return Err(Error::InvalidCredential(format!(
                    "invalid_grant ({description}); likely causes: the server clock is skewed \
                     or the service account key has been revoked"
                )));
            }
            return Err(Error::InvalidCredential(format!("{error}: {description}")));
        }

        match (body.access_token, body.expires_in) {
            (Some(token), Some(expires_in)) => Ok(AccessToken {
                token,
                expiration_time_millis: now_millis + expires_in * 1000,
            }),
            _ => Err(Error::InvalidCredential(
                "token response is missing access_token or expires_in".to_string(),
            )),
        }
    }

    fn sign_assertion(&self) -> Result<String> {
        let claims = Claims::with_custom_claims(
            AssertionClaims {
                scope: SCOPES.join(" "),
            },
            Duration::from_hours(1),
        )
        .with_issuer(&self.account.client_email)
        .with_subject(&self.account.client_email)
        .with_audience(OAUTH_TOKEN_URL);
        jwt::sign_claims(claims, &self.account.private_key, None)
    }
}
