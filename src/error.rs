use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything this crate can fail with. `code()` yields the stable
/// identifier surfaced in error payloads.
#[derive(Debug, Error)]
pub enum Error {
    #[error("user not found")]
    UserNotFound,
    #[error("user disabled")]
    UserDisabled,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("token expired")]
    TokenExpired,
    #[error("token revoked")]
    TokenRevoked,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token header carries no kid")]
    NoKidInHeader,
    #[error("no public key matches kid {0}")]
    NoMatchingKid(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("private key is not a usable pkcs#8 rsa key: {0}")]
    CryptoKeyInvalid(String),
    #[error("signing failed: {0}")]
    SignFailed(String),
    #[error("jwks fetch failed with status {status}: {body}")]
    JwksFetchFailed { status: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::UserNotFound => "USER_NOT_FOUND",
            Error::UserDisabled => "USER_DISABLED",
            Error::InvalidCredential(_) => "INVALID_CREDENTIAL",
            Error::TokenExpired => "TOKEN_EXPIRED",
            Error::TokenRevoked => "TOKEN_REVOKED",
            Error::InvalidSignature => "INVALID_SIGNATURE",
            Error::NoKidInHeader => "NO_KID_IN_HEADER",
            Error::NoMatchingKid(_) => "NO_MATCHING_KID",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::CryptoKeyInvalid(_) => "CRYPTO_KEY_INVALID",
            Error::SignFailed(_) => "SIGN_FAILED",
            Error::JwksFetchFailed { .. } => "JWKS_FETCH_FAILED",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// `USER_NOT_FOUND` can be benign (a legitimately deleted account), so
    /// callers get a direct predicate rather than string matching.
    pub fn is_user_not_found(&self) -> bool {
        matches!(self, Error::UserNotFound)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::UserNotFound.code(), "USER_NOT_FOUND");
        assert_eq!(Error::TokenRevoked.code(), "TOKEN_REVOKED");
        assert_eq!(Error::NoMatchingKid("k".into()).code(), "NO_MATCHING_KID");
        assert_eq!(
            Error::JwksFetchFailed {
                status: 503,
                body: String::new()
            }
            .code(),
            "JWKS_FETCH_FAILED"
        );
    }

    #[test]
    fn user_not_found_predicate() {
        assert!(Error::UserNotFound.is_user_not_found());
        assert!(!Error::UserDisabled.is_user_not_found());
    }
}
