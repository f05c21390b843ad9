//! Identity Toolkit and Secure Token clients: custom-token sign-in,
//! refresh-token exchange, the revocation lookup, and the administrative
//! delete helper.

use crate::credential::Credential;
use crate::error::{Error, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) const IDENTITY_TOOLKIT_BASE: &str = "https://identitytoolkit.googleapis.com";
pub(crate) const SECURE_TOKEN_BASE: &str = "https://securetoken.googleapis.com";

const APP_CHECK_HEADER: &str = "X-Firebase-AppCheck";

pub struct IdentityClient {
    client: reqwest::Client,
    credential: Arc<Credential>,
    project_id: String,
    tenant_id: Option<String>,
    api_key: Option<String>,
    identity_base: String,
    secure_token_base: String,
}

/// An (ID token, refresh token) pair handed back by the provider.
#[derive(Clone, Debug)]
pub struct SignInResult {
    pub id_token: String,
    pub refresh_token: String,
}

/// The slice of the user record revocation checks care about.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub uid: String,
    pub valid_since: Option<u64>,
    pub disabled: bool,
}

impl IdentityClient {
    pub fn new(
        client: reqwest::Client,
        credential: Arc<Credential>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            credential,
            project_id: project_id.into(),
            tenant_id: None,
            api_key: None,
            identity_base: IDENTITY_TOOLKIT_BASE.to_string(),
            secure_token_base: SECURE_TOKEN_BASE.to_string(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Point both services somewhere else; used by the emulator toggle and
    /// by tests.
    pub fn with_base_urls(
        mut self,
        identity_base: impl Into<String>,
        secure_token_base: impl Into<String>,
    ) -> Self {
        self.identity_base = identity_base.into();
        self.secure_token_base = secure_token_base.into();
        self
    }

    fn parent(&self) -> String {
        match &self.tenant_id {
            Some(tenant_id) => format!("projects/{}/tenants/{tenant_id}", self.project_id),
            None => format!("projects/{}", self.project_id),
        }
    }

    /// Exchange a service-signed custom token for an (ID token, refresh
    /// token) pair.
    pub async fn sign_in_with_custom_token(
        &self,
        token: &str,
        app_check_token: Option<&str>,
    ) -> Result<SignInResult> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Body<'a> {
            token: &'a str,
            return_secure_token: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            tenant_id: Option<&'a str>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SignInResponse {
            id_token: String,
            refresh_token: String,
        }

        let access_token = self.credential.get_access_token(false).await?;
        let mut request = self
            .client
            .post(format!(
                "{}/v1/{}/accounts:signInWithCustomToken",
                self.identity_base,
                self.parent()
            ))
            .bearer_auth(&access_token.token)
            .json(&Body {
                token,
                return_secure_token: true,
                tenant_id: self.tenant_id.as_deref(),
            });
        if let Some(app_check_token) = app_check_token {
            request = request.header(APP_CHECK_HEADER, app_check_token);
        }

        let response: SignInResponse = parse_response(request.send().await?).await?;
        Ok(SignInResult {
            id_token: response.id_token,
            refresh_token: response.refresh_token,
        })
    }

    /// Exchange a refresh token for a fresh (ID token, refresh token) pair.
    pub async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<SignInResult> {
        #[derive(Deserialize)]
        struct RefreshResponse {
            id_token: String,
            refresh_token: String,
        }

        let api_key = self.api_key.as_deref().ok_or_else(|| {
            Error::InvalidArgument("an api key is required for refresh-token exchange".to_string())
        })?;
        let response = self
            .client
            .post(format!("{}/v1/token?key={api_key}", self.secure_token_base))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let response: RefreshResponse = parse_response(response).await?;
        Ok(SignInResult {
            id_token: response.id_token,
            refresh_token: response.refresh_token,
        })
    }

    /// Look a user up by uid, surfacing the revocation watermark and the
    /// disabled flag.
    pub async fn get_user(&self, uid: &str) -> Result<UserRecord> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Body<'a> {
            local_id: [&'a str; 1],
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LookupResponse {
            users: Option<Vec<LookupUser>>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LookupUser {
            local_id: String,
            valid_since: Option<String>,
            #[serde(default)]
            disabled: bool,
        }

        let access_token = self.credential.get_access_token(false).await?;
        let response = self
            .client
            .post(format!(
                "{}/v1/{}/accounts:lookup",
                self.identity_base,
                self.parent()
            ))
            .bearer_auth(&access_token.token)
            .json(&Body { local_id: [uid] })
            .send()
            .await?;

        let response: LookupResponse = parse_response(response).await?;
        let user = response
            .users
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or(Error::UserNotFound)?;
        Ok(UserRecord {
            uid: user.local_id,
            valid_since: user.valid_since.and_then(|since| since.parse().ok()),
            disabled: user.disabled,
        })
    }

    /// Administrative helper: delete a user outright.
    pub async fn delete_user(&self, uid: &str) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Body<'a> {
            local_id: &'a str,
        }

        let access_token = self.credential.get_access_token(false).await?;
        let response = self
            .client
            .post(format!(
                "{}/v1/{}/accounts:delete",
                self.identity_base,
                self.parent()
            ))
            .bearer_auth(&access_token.token)
            .json(&Body { local_id: uid })
            .send()
            .await?;

        parse_response::<serde_json::Value>(response).await?;
        Ok(())
    }
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(map_upstream_error(status, &body));
    }
    serde_json::from_str(&body)
        .map_err(|err| Error::Internal(format!("unparseable response ({status}): {err}")))
}

/// Turn an upstream error body into the most specific taxonomy code the
/// message allows. Messages sometimes carry suffixes
/// (`"USER_NOT_FOUND : no record"`), so only the leading word is matched.
fn map_upstream_error(status: StatusCode, body: &str) -> Error {
    #[derive(Deserialize)]
    struct UpstreamError {
        error: Option<UpstreamErrorBody>,
    }
    #[derive(Deserialize)]
    struct UpstreamErrorBody {
        message: Option<String>,
    }

    let message = serde_json::from_str::<UpstreamError>(body)
        .ok()
        .and_then(|body| body.error)
        .and_then(|error| error.message);
    let Some(message) = message else {
        return Error::Internal(format!("upstream error ({})", status.as_u16()));
    };

    match message.split([' ', ':']).next().unwrap_or_default() {
        "USER_NOT_FOUND" => Error::UserNotFound,
        "USER_DISABLED" => Error::UserDisabled,
        "TOKEN_EXPIRED" => Error::TokenExpired,
        "INVALID_REFRESH_TOKEN" | "MISSING_REFRESH_TOKEN" | "INVALID_GRANT_TYPE"
        | "INVALID_CUSTOM_TOKEN" | "CREDENTIAL_MISMATCH" => Error::InvalidCredential(message),
        _ => Error::Internal(format!("upstream error ({status}): {message}")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::credential::{ServiceAccount, ServiceAccountCredential};
    use crate::test_util::test_key_pem;
    use axum::routing::post;
    use axum::{Json, Router};

    fn credential_with_token_url(url: &str) -> Arc<Credential> {
        let account = ServiceAccount {
            project_id: "p1".to_string(),
            client_email: "sa@p1.iam.gserviceaccount.com".to_string(),
            private_key: test_key_pem().to_string(),
        };
        Arc::new(Credential::ServiceAccount(
            ServiceAccountCredential::new(account, reqwest::Client::new())
                .with_token_url(format!("{url}/oauth")),
        ))
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn oauth_route(app: Router) -> Router {
        app.route(
            "/oauth",
            post(|| async {
                Json(serde_json::json!({ "access_token": "at-1", "expires_in": 3600 }))
            }),
        )
    }

    #[tokio::test]
    async fn refresh_exchange_returns_the_new_pair() {
        let app = oauth_route(Router::new().route(
            "/v1/token",
            post(|| async {
                Json(serde_json::json!({
                    "id_token": "fresh-id",
                    "refresh_token": "fresh-refresh",
                }))
            }),
        ));
        let base = spawn(app).await;
        let client = IdentityClient::new(
            reqwest::Client::new(),
            credential_with_token_url(&base),
            "p1",
        )
        .with_api_key(Some("key1".to_string()))
        .with_base_urls(base.clone(), base.clone());

        let result = client
            .exchange_refresh_token("old-refresh")
            .await
            .expect("exchanged");
        assert_eq!(result.id_token, "fresh-id");
        assert_eq!(result.refresh_token, "fresh-refresh");
    }

    #[tokio::test]
    async fn refresh_exchange_maps_upstream_error_strings() {
        let app = oauth_route(Router::new().route(
            "/v1/token",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": { "message": "USER_NOT_FOUND : no record", "code": 400 }
                    })),
                )
            }),
        ));
        let base = spawn(app).await;
        let client = IdentityClient::new(
            reqwest::Client::new(),
            credential_with_token_url(&base),
            "p1",
        )
        .with_api_key(Some("key1".to_string()))
        .with_base_urls(base.clone(), base.clone());

        let err = client
            .exchange_refresh_token("gone")
            .await
            .expect_err("rejected");
        assert!(err.is_user_not_found());
    }

    #[tokio::test]
    async fn lookup_parses_the_revocation_fields() {
        let app = oauth_route(Router::new().route(
            "/v1/projects/p1/accounts:lookup",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["localId"][0], "u1");
                Json(serde_json::json!({
                    "users": [{
                        "localId": "u1",
                        "validSince": "1710132000",
                        "disabled": false,
                    }]
                }))
            }),
        ));
        let base = spawn(app).await;
        let client = IdentityClient::new(
            reqwest::Client::new(),
            credential_with_token_url(&base),
            "p1",
        )
        .with_base_urls(base.clone(), base.clone());

        let user = client.get_user("u1").await.expect("found");
        assert_eq!(user.uid, "u1");
        assert_eq!(user.valid_since, Some(1_710_132_000));
        assert!(!user.disabled);
    }

    #[tokio::test]
    async fn lookup_without_a_record_is_user_not_found() {
        let app = oauth_route(Router::new().route(
            "/v1/projects/p1/accounts:lookup",
            post(|| async { Json(serde_json::json!({})) }),
        ));
        let base = spawn(app).await;
        let client = IdentityClient::new(
            reqwest::Client::new(),
            credential_with_token_url(&base),
            "p1",
        )
        .with_base_urls(base.clone(), base.clone());

        let err = client.get_user("ghost").await.expect_err("missing");
        assert!(err.is_user_not_found());
    }

    #[tokio::test]
    async fn tenants_scope_the_request_path() {
        let app = oauth_route(Router::new().route(
            "/v1/projects/p1/tenants/t1/accounts:signInWithCustomToken",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["tenantId"], "t1");
                assert_eq!(body["returnSecureToken"], true);
                Json(serde_json::json!({
                    "idToken": "id-1",
                    "refreshToken": "refresh-1",
                }))
            }),
        ));
        let base = spawn(app).await;
        let client = IdentityClient::new(
            reqwest::Client::new(),
            credential_with_token_url(&base),
            "p1",
        )
        .with_tenant(Some("t1".to_string()))
        .with_base_urls(base.clone(), base.clone());

        let result = client
            .sign_in_with_custom_token("custom-token", None)
            .await
            .expect("signed in");
        assert_eq!(result.id_token, "id-1");
        assert_eq!(result.refresh_token, "refresh-1");
    }
}
