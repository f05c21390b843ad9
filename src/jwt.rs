//! RS256 signing for service-account-issued tokens: OAuth2 assertions,
//! custom tokens, and AppCheck exchange tokens all go through here.

use crate::credential::ServiceAccount;
use crate::error::{Error, Result};
use jwt_simple::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const CUSTOM_TOKEN_AUDIENCE: &str =
    "https://identitytoolkit.googleapis.com/google.identity.identitytoolkit.v1.IdentityToolkit";

/// Sign a claim set under RS256 with a PKCS#8 PEM private key.
pub fn sign_claims<C: Serialize + serde::de::DeserializeOwned>(
    claims: JWTClaims<C>,
    private_key_pem: &str,
    key_id: Option<&str>,
) -> Result<String> {
    let key_pair = RS256KeyPair::from_pem(private_key_pem)
        .map_err(|err| Error::CryptoKeyInvalid(err.to_string()))?;
    let key_pair = match key_id {
        Some(kid) => key_pair.with_key_id(kid),
        None => key_pair,
    };
    key_pair
        .sign(claims)
        .map_err(|err| Error::SignFailed(err.to_string()))
}

#[derive(Debug, Serialize, Deserialize)]
struct CustomTokenClaims {
    uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    claims: Option<Map<String, Value>>,
}

/// Mint a custom token the identity provider will exchange for an
/// (ID token, refresh token) pair. Valid for one hour.
pub fn create_custom_token(
    account: &ServiceAccount,
    uid: &str,
    tenant_id: Option<&str>,
    developer_claims: Option<Map<String, Value>>,
) -> Result<String> {
    let custom = CustomTokenClaims {
        uid: uid.to_string(),
        tenant_id: tenant_id.map(str::to_string),
        claims: developer_claims,
    };
    let claims = Claims::with_custom_claims(custom, Duration::from_hours(1))
        .with_issuer(&account.client_email)
        .with_subject(&account.client_email)
        .with_audience(CUSTOM_TOKEN_AUDIENCE);
    sign_claims(claims, &account.private_key, None)
}
