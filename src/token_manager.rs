use crate::claims::{DecodedIdToken, Tokens};
use crate::error::{Error, Result};
use crate::identity::IdentityClient;
use crate::jwk_cache::KeyCache;
use crate::token_verifier::{self, VerifyOptions};
use std::sync::Arc;

/// Verifies ID tokens against the provider's rotating keys and refreshes
/// expired ones through the refresh-token exchange.
#[derive(Clone)]
pub struct TokenManager {
    key_cache: Arc<KeyCache>,
    identity: Arc<IdentityClient>,
    options: VerifyOptions,
    jwk_url: String,
    /// Emulator tokens are unsigned; claims are still validated.
    skip_signature: bool,
    /// A configured tenant forces the lookup even without `check_revoked`.
    tenant_configured: bool,
}

impl TokenManager {
    pub fn new(
        project_id: &str,
        tenant_id: Option<String>,
        key_cache: Arc<KeyCache>,
        identity: Arc<IdentityClient>,
    ) -> Self {
        let tenant_configured = tenant_id.is_some();
        Self {
            key_cache,
            identity,
            options: VerifyOptions::for_project(project_id, tenant_id),
            jwk_url: crate::ID_TOKEN_CERT_URL.to_string(),
            skip_signature: false,
            tenant_configured,
        }
    }

    pub fn with_jwk_url(mut self, jwk_url: impl Into<String>) -> Self {
        self.jwk_url = jwk_url.into();
        self
    }

    pub fn with_skip_signature(mut self, skip_signature: bool) -> Self {
        self.skip_signature = skip_signature;
        self
    }

    pub fn with_time_tolerance_secs(mut self, tolerance: u64) -> Self {
        self.options.time_tolerance_secs = tolerance;
        self
    }

    pub async fn verify_id_token(
        &self,
        token: &str,
        check_revoked: bool,
        current_time: Option<u64>,
    ) -> Result<DecodedIdToken> {
        let mut options = self.options.clone();
        options.current_time = current_time;

        let decoded = if self.skip_signature {
            token_verifier::decode_unverified(token, &options)?
        } else {
            let keys = self.key_cache.get(&self.jwk_url).await?;
            token_verifier::verify_id_token_with_keys(token, &keys, &options)?
        };

        if check_revoked || self.tenant_configured {
            self.check_revocation(&decoded).await?;
        }
        Ok(decoded)
    }

    async fn check_revocation(&self, decoded: &DecodedIdToken) -> Result<()> {
        let user = self.identity.get_user(&decoded.uid).await?;
        // Revocation outranks the disabled flag when both apply.
        if let Some(valid_since) = user.valid_since {
            if decoded.auth_time < valid_since {
                return Err(Error::TokenRevoked);
            }
        }
        if user.disabled {
            return Err(Error::UserDisabled);
        }
        Ok(())
    }

    /// Exchange a refresh token and verify the replacement ID token.
    pub async fn refresh_id_token(&self, refresh_token: &str) -> Result<Tokens> {
        let exchanged = self.identity.exchange_refresh_token(refresh_token).await?;
        let decoded = self
            .verify_id_token(&exchanged.id_token, false, None)
            .await?;
        tracing::debug!(uid = %decoded.uid, "refreshed an expired id token");
        Ok(Tokens {
            decoded_id_token: decoded,
            id_token: exchanged.id_token,
            refresh_token: Some(exchanged.refresh_token),
            custom_token: None,
        })
    }

    /// Verify, and when the token has merely expired, exchange the refresh
    /// token and re-verify the replacement. Any other failure is passed
    /// through untouched.
    pub async fn verify_and_refresh_expired_id_token(
        &self,
        id_token: &str,
        refresh_token: Option<&str>,
        check_revoked: bool,
    ) -> Result<Tokens> {
        match self.verify_id_token(id_token, check_revoked, None).await {
            Ok(decoded) => Ok(Tokens {
                decoded_id_token: decoded,
                id_token: id_token.to_string(),
                refresh_token: refresh_token.map(str::to_string),
                custom_token: None,
            }),
            Err(Error::TokenExpired) => {
                let Some(refresh_token) = refresh_token else {
                    return Err(Error::TokenExpired);
                };
                self.refresh_id_token(refresh_token).await
            }
            Err(err) => Err(err),
        }
    }
}
