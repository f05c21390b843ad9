mod app_check;
mod b64;
mod claims;
mod cookie;
mod credential;
mod error;
mod identity;
mod jwk_cache;
mod jwt;
pub mod middleware;
mod settings;
mod token_manager;
mod token_verifier;

pub use app_check::{AppCheckClient, AppCheckToken};
pub use claims::{DecodedIdToken, FirebaseClaims, Tokens};
pub use cookie::{
    expire_cookie, parse_set_cookie, request_cookie, serialize_cookie, CookieSigner, ParsedCookie,
    SameSite, SerializeOptions,
};
pub use credential::{AccessToken, Credential, ServiceAccount, ServiceAccountCredential};
pub use error::{Error, Result};
pub use identity::{IdentityClient, SignInResult, UserRecord};
pub use jwk_cache::KeyCache;
pub use jwt::{create_custom_token, sign_claims};
pub use settings::{RedirectOptions, Settings};
pub use token_manager::TokenManager;
pub use token_verifier::{decode_unverified, verify_id_token_with_keys, VerifyOptions};

pub use jwt_simple::prelude::RS256PublicKey;

pub const KTY: &str = "RSA";
pub const ALG: &str = "RS256";
pub const TOKEN_SIG_TYPE: &str = "JWT";

/// Where Google serves the rotating ID-token verification keys.
pub(crate) const ID_TOKEN_CERT_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/securetoken@system.gserviceaccount.com";

pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
