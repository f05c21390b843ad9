//! The per-request session state machine, packaged as a tower layer.
//!
//! Requests to the login path exchange a bearer ID token for a signed
//! session cookie; requests to the logout path expire it; everything else
//! is verified from the cookie, refreshed server-side when the inner token
//! has expired, and admitted, redirected, or passed through anonymously.

use crate::app_check::AppCheckClient;
use crate::claims::{DecodedIdToken, Tokens};
use crate::cookie::{self, CookieSigner};
use crate::credential::{Credential, ServiceAccountCredential};
use crate::error::{Error, Result};
use crate::identity::IdentityClient;
use crate::jwk_cache::KeyCache;
use crate::jwt;
use crate::settings::Settings;
use crate::token_manager::TokenManager;
use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Reject a verified token on application-specific grounds.
pub type TokenPredicate = Arc<dyn Fn(&DecodedIdToken) -> bool + Send + Sync>;
/// Replace the default pass-through on admission; `None` keeps the default.
pub type AuthenticatedHook = Arc<dyn Fn(&Tokens) -> Option<Response> + Send + Sync>;
/// Replace the default unauthenticated handling on errors.
pub type ErrorHook = Arc<dyn Fn(&Error) -> Option<Response> + Send + Sync>;

#[derive(Clone, Default)]
struct Hooks {
    is_token_valid: Option<TokenPredicate>,
    on_authenticated: Option<AuthenticatedHook>,
    on_error: Option<ErrorHook>,
}

/// What the cookie carries on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CookiePayload {
    id_token: String,
    refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_token: Option<String>,
}

enum Outcome {
    Admit {
        tokens: Tokens,
        set_cookie: Option<String>,
    },
    Unauthed(Option<Error>),
    Failed(Error),
}

#[derive(Clone)]
pub struct SessionLayer {
    auth: SessionAuth,
}

impl SessionLayer {
    pub fn new(settings: Settings) -> Result<Self> {
        Ok(Self {
            auth: SessionAuth::new(settings)?,
        })
    }

    pub fn with_token_predicate(mut self, predicate: TokenPredicate) -> Self {
        self.auth.hooks.is_token_valid = Some(predicate);
        self
    }

    pub fn with_authenticated_hook(mut self, hook: AuthenticatedHook) -> Self {
        self.auth.hooks.on_authenticated = Some(hook);
        self
    }

    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.auth.hooks.on_error = Some(hook);
        self
    }
}

impl<S> Layer<S> for SessionLayer {
    type Service = SessionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionService {
            inner,
            auth: self.auth.clone(),
        }
    }
}

#[derive(Clone)]
struct SessionAuth {
    settings: Arc<Settings>,
    manager: TokenManager,
    identity: Arc<IdentityClient>,
    signer: CookieSigner,
    app_check: Option<Arc<AppCheckClient>>,
    hooks: Hooks,
}

impl SessionAuth {
    fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;

        let mut credential = ServiceAccountCredential::new(
            settings.service_account.clone(),
            client.clone(),
        );
        if let Some(token_url) = &settings.oauth_token_url {
            credential = credential.with_token_url(token_url.clone());
        }
        let credential = Arc::new(Credential::ServiceAccount(credential));

        let identity = Arc::new(
            IdentityClient::new(
                client.clone(),
                credential.clone(),
                settings.service_account.project_id.clone(),
            )
            .with_tenant(settings.tenant_id.clone())
            .with_api_key(settings.api_key.clone())
            .with_base_urls(settings.identity_base(), settings.secure_token_base()),
        );

        let key_cache = Arc::new(KeyCache::new(client.clone()));
        let manager = TokenManager::new(
            &settings.service_account.project_id,
            settings.tenant_id.clone(),
            key_cache,
            identity.clone(),
        )
        .with_jwk_url(settings.jwk_url.clone())
        .with_skip_signature(settings.emulator_host().is_some())
        .with_time_tolerance_secs(settings.time_tolerance_secs.unwrap_or(0));

        let signer = CookieSigner::new(&settings.cookie_signature_keys)?;
        let app_check = settings.app_check_app_id.as_ref().map(|_| {
            let mut app_check =
                AppCheckClient::new(settings.service_account.clone(), client.clone());
            if let Some(base_url) = &settings.app_check_base_url {
                app_check = app_check.with_base_url(base_url.clone());
            }
            Arc::new(app_check)
        });

        Ok(Self {
            settings: Arc::new(settings),
            manager,
            identity,
            signer,
            app_check,
            hooks: Hooks::default(),
        })
    }

    async fn handle_login(&self, headers: &HeaderMap) -> Response {
        let Some(bearer) = bearer_token(headers) else {
            metrics::counter!("session-login-rejected", "reason" => "missing-token").increment(1);
            tracing::debug!("login request missing required bearer token");
            return error_response(&Error::InvalidArgument(
                "missing bearer token".to_string(),
            ));
        };

        let decoded = match self
            .manager
            .verify_id_token(bearer, self.settings.check_revoked, None)
            .await
        {
            Ok(decoded) => decoded,
            Err(err) => {
                metrics::counter!("session-login-rejected", "reason" => err.code()).increment(1);
                tracing::debug!(code = err.code(), "login token rejected");
                return error_response(&err);
            }
        };

        if let Some(predicate) = &self.hooks.is_token_valid {
            if !predicate(&decoded) {
                metrics::counter!("session-login-rejected", "reason" => "predicate").increment(1);
                return error_response(&Error::InvalidCredential(
                    "token rejected by the configured predicate".to_string(),
                ));
            }
        }

        let payload = match self.login_payload(bearer, &decoded).await {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(code = err.code(), "login token exchange failed");
                return error_response(&err);
            }
        };
        let set_cookie = match self.signed_cookie(&payload) {
            Ok(set_cookie) => set_cookie,
            Err(err) => return error_response(&err),
        };

        metrics::counter!("session-login-authorized").increment(1);
        if self.settings.debug {
            tracing::debug!(uid = %decoded.uid, "login issued a session cookie");
        }
        (
            StatusCode::OK,
            [(header::SET_COOKIE, set_cookie)],
            Json(serde_json::json!({ "status": "authenticated", "uid": decoded.uid })),
        )
            .into_response()
    }

    /// With an API key configured, the presented token is upgraded through
    /// the custom-token flow so the cookie gains a refresh token. Without
    /// one the cookie carries only the presented token.
    async fn login_payload(
        &self,
        id_token: &str,
        decoded: &DecodedIdToken,
    ) -> Result<CookiePayload> {
        if self.settings.api_key.is_none() {
            return Ok(CookiePayload {
                id_token: id_token.to_string(),
                refresh_token: String::new(),
                custom_token: None,
            });
        }

        let custom_token = jwt::create_custom_token(
            &self.settings.service_account,
            &decoded.uid,
            self.settings.tenant_id.as_deref(),
            None,
        )?;
        let app_check_token = match (&self.app_check, &self.settings.app_check_app_id) {
            (Some(app_check), Some(app_id)) => Some(app_check.get_token(app_id).await?.token),
            _ => None,
        };
        let exchanged = self
            .identity
            .sign_in_with_custom_token(&custom_token, app_check_token.as_deref())
            .await?;
        Ok(CookiePayload {
            id_token: exchanged.id_token,
            refresh_token: exchanged.refresh_token,
            custom_token: Some(custom_token),
        })
    }

    fn handle_logout(&self) -> Response {
        let set_cookie =
            cookie::expire_cookie(&self.settings.cookie_name, &self.settings.cookie_serialize_options);
        (
            StatusCode::OK,
            [(header::SET_COOKIE, set_cookie)],
            Json(serde_json::json!({ "status": "signed-out" })),
        )
            .into_response()
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Outcome {
        let cookie_header = headers
            .get(header::COOKIE)
            .and_then(|value| value.to_str().ok());
        let Some(raw) = cookie::request_cookie(cookie_header, &self.settings.cookie_name) else {
            return Outcome::Unauthed(None);
        };

        let payload_bytes = match self.signer.verify(raw) {
            Ok(bytes) => bytes,
            Err(err) => return Outcome::Unauthed(Some(err)),
        };
        let payload: CookiePayload = match serde_json::from_slice(&payload_bytes) {
            Ok(payload) => payload,
            Err(_) => {
                return Outcome::Unauthed(Some(Error::InvalidCredential(
                    "malformed session cookie payload".to_string(),
                )))
            }
        };

        let refresh_token = Some(payload.refresh_token.as_str()).filter(|token| !token.is_empty());
        let mut tokens = match self
            .manager
            .verify_id_token(&payload.id_token, self.settings.check_revoked, None)
            .await
        {
            Ok(decoded) => Tokens {
                decoded_id_token: decoded,
                id_token: payload.id_token.clone(),
                refresh_token: refresh_token.map(str::to_string),
                custom_token: None,
            },
            Err(Error::TokenExpired) => {
                let Some(refresh_token) = refresh_token else {
                    return Outcome::Unauthed(Some(Error::TokenExpired));
                };
                match self.manager.refresh_id_token(refresh_token).await {
                    Ok(tokens) => tokens,
                    // The exchange admits only one unauthenticated failure;
                    // everything else it returns is an error.
                    Err(Error::UserNotFound) => {
                        return Outcome::Unauthed(Some(Error::UserNotFound))
                    }
                    Err(err) => return Outcome::Failed(err),
                }
            }
            Err(
                err @ (Error::UserNotFound
                | Error::UserDisabled
                | Error::TokenRevoked
                | Error::InvalidSignature
                | Error::NoKidInHeader
                | Error::NoMatchingKid(_)),
            ) => return Outcome::Unauthed(Some(err)),
            Err(err) => return Outcome::Failed(err),
        };

        if let Some(predicate) = &self.hooks.is_token_valid {
            if !predicate(&tokens.decoded_id_token) {
                return Outcome::Unauthed(Some(Error::InvalidCredential(
                    "token rejected by the configured predicate".to_string(),
                )));
            }
        }
        tokens.custom_token = payload.custom_token.clone();

        let set_cookie = if tokens.id_token != payload.id_token {
            metrics::counter!("session-token-refreshed").increment(1);
            let refreshed = CookiePayload {
                id_token: tokens.id_token.clone(),
                refresh_token: tokens.refresh_token.clone().unwrap_or_default(),
                custom_token: payload.custom_token,
            };
            match self.signed_cookie(&refreshed) {
                Ok(set_cookie) => Some(set_cookie),
                Err(err) => return Outcome::Failed(err),
            }
        } else {
            None
        };
        Outcome::Admit { tokens, set_cookie }
    }

    fn signed_cookie(&self, payload: &CookiePayload) -> Result<String> {
        let bytes = serde_json::to_vec(payload)?;
        let value = self.signer.sign(&bytes)?;
        Ok(cookie::serialize_cookie(
            &self.settings.cookie_name,
            &value,
            &self.settings.cookie_serialize_options,
        ))
    }

    fn unauthenticated_response(&self, req: &Request) -> Option<Response> {
        let redirect = self.settings.redirect_options.as_ref()?;
        let original = req
            .uri()
            .path_and_query()
            .map(|path_and_query| path_and_query.as_str())
            .unwrap_or_else(|| req.uri().path());
        let location = format!(
            "{}?{}={}",
            redirect.path,
            redirect.param_name,
            encode_query_value(original)
        );
        Some((StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response())
    }
}

#[derive(Clone)]
pub struct SessionService<S> {
    inner: S,
    auth: SessionAuth,
}

impl<S> Service<Request> for SessionService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    #[inline]
    fn poll_ready(&mut self, ctx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(ctx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let auth = self.auth.clone();
        let not_ready_inner = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, not_ready_inner);

        Box::pin(async move {
            let path = req.uri().path();
            if path == auth.settings.login_path {
                return Ok(auth.handle_login(req.headers()).await);
            }
            if path == auth.settings.logout_path {
                return Ok(auth.handle_logout());
            }

            match auth.authenticate(req.headers()).await {
                Outcome::Admit { tokens, set_cookie } => {
                    metrics::counter!("session-request-authorized").increment(1);
                    if let Some(hook) = &auth.hooks.on_authenticated {
                        if let Some(mut response) = hook(&tokens) {
                            append_set_cookie(&mut response, set_cookie.as_deref());
                            return Ok(response);
                        }
                    }
                    req.extensions_mut().insert(tokens);
                    let mut response = inner.call(req).await?;
                    append_set_cookie(&mut response, set_cookie.as_deref());
                    Ok(response)
                }
                Outcome::Unauthed(reason) => {
                    if let Some(reason) = &reason {
                        metrics::counter!("session-auth-rejected", "reason" => reason.code())
                            .increment(1);
                        tracing::debug!(code = reason.code(), "request not authenticated");
                    }
                    match auth.unauthenticated_response(&req) {
                        Some(response) => Ok(response),
                        None => inner.call(req).await,
                    }
                }
                Outcome::Failed(err) => {
                    metrics::counter!("session-auth-errored", "reason" => err.code()).increment(1);
                    tracing::warn!(code = err.code(), error = %err, "session verification errored");
                    if let Some(hook) = &auth.hooks.on_error {
                        if let Some(response) = hook(&err) {
                            return Ok(response);
                        }
                    }
                    match auth.unauthenticated_response(&req) {
                        Some(response) => Ok(response),
                        None => inner.call(req).await,
                    }
                }
            }
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
}

fn error_response(err: &Error) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "code": err.code(), "message": err.to_string() })),
    )
        .into_response()
}

fn append_set_cookie(response: &mut Response, set_cookie: Option<&str>) {
    if let Some(set_cookie) = set_cookie {
        match HeaderValue::from_str(set_cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(err) => tracing::error!(?err, "refreshed cookie is not a valid header value"),
        }
    }
}

/// Percent-encode a query value, leaving `/` and `:` intact so redirect
/// locations keep the original path readable.
fn encode_query_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' | b':' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
