use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Firebase-specific claims carried alongside the registered JWT claims.
/// Anything not named here (developer custom claims) lands in `custom`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FirebaseClaims {
    #[serde(default)]
    pub email_verified: bool,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub user_id: Option<String>,
    pub auth_time: u64,
    #[serde(default)]
    pub firebase: Value,
    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

impl FirebaseClaims {
    pub fn tenant(&self) -> Option<&str> {
        self.firebase.get("tenant").and_then(Value::as_str)
    }

    pub fn sign_in_provider(&self) -> Option<&str> {
        self.firebase.get("sign_in_provider").and_then(Value::as_str)
    }
}

/// A fully validated ID token.
#[derive(Clone, Debug)]
pub struct DecodedIdToken {
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub auth_time: u64,
    pub issued_at: u64,
    pub expires_at: u64,
    pub audience: String,
    pub issuer: String,
    pub subject: String,
    pub tenant_id: Option<String>,
    pub custom_claims: Map<String, Value>,
}

/// The admission record produced by the token manager and attached to
/// admitted requests.
#[derive(Clone, Debug)]
pub struct Tokens {
    pub decoded_id_token: DecodedIdToken,
    pub id_token: String,
    pub refresh_token: Option<String>,
    pub custom_token: Option<String>,
}
