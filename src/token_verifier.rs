use crate::claims::{DecodedIdToken, FirebaseClaims};
use crate::error::{Error, Result};
use crate::{b64, ALG, TOKEN_SIG_TYPE};
use jwt_simple::prelude::*;
use jwt_simple::JWTError;
use std::collections::HashMap;

/// Expectations a token must meet. `current_time` pins the verification
/// clock for tests and replays; wall clock otherwise.
#[derive(Clone, Debug)]
pub struct VerifyOptions {
    pub audience: String,
    pub issuer: String,
    pub tenant_id: Option<String>,
    pub current_time: Option<u64>,
    pub time_tolerance_secs: u64,
    /// Reject tokens issued longer than this many seconds ago.
    pub max_age_secs: Option<u64>,
}

impl VerifyOptions {
    pub fn for_project(project_id: &str, tenant_id: Option<String>) -> Self {
        Self {
            audience: project_id.to_string(),
            issuer: format!("https://securetoken.google.com/{project_id}"),
            tenant_id,
            current_time: None,
            time_tolerance_secs: 0,
            max_age_secs: None,
        }
    }

    fn now(&self) -> u64 {
        self.current_time.unwrap_or_else(crate::unix_secs)
    }
}

/// Verify a compact RS256 JWS against a kid-indexed key set, then validate
/// its claims.
pub fn verify_id_token_with_keys(
    token: &str,
    keys: &HashMap<String, RS256PublicKey>,
    options: &VerifyOptions,
) -> Result<DecodedIdToken> {
    let metadata = Token::decode_metadata(token)
        .map_err(|_| Error::InvalidArgument("malformed jwt".to_string()))?;
    if metadata.algorithm() != ALG
        || metadata.signature_type().is_some_and(|typ| typ != TOKEN_SIG_TYPE)
    {
        return Err(Error::InvalidArgument(format!(
            "unexpected token metadata headers: alg {}",
            metadata.algorithm()
        )));
    }
    let key_id = metadata.key_id().ok_or(Error::NoKidInHeader)?;
    let public_key = keys
        .get(key_id)
        .ok_or_else(|| Error::NoMatchingKid(key_id.to_string()))?;

    // Malformed payloads are INVALID_ARGUMENT, not INVALID_SIGNATURE.
    peek_claims(token)?;

    let verify_options = VerificationOptions {
        accept_future: true,
        time_tolerance: Some(Duration::from_secs(options.time_tolerance_secs)),
        artificial_time: options.current_time.map(UnixTimeStamp::from_secs),
        max_validity: None,
        ..VerificationOptions::default()
    };
    let claims = public_key
        .verify_token::<FirebaseClaims>(token, Some(verify_options))
        .map_err(map_verify_error)?;

    validate_claims(&claims, options)?;
    into_decoded(claims)
}

/// Emulator path: the emulator signs nothing, so the token is only parsed
/// and claim-validated.
pub fn decode_unverified(token: &str, options: &VerifyOptions) -> Result<DecodedIdToken> {
    let claims = peek_claims(token)?;
    validate_claims(&claims, options)?;
    into_decoded(claims)
}

fn peek_claims(token: &str) -> Result<JWTClaims<FirebaseClaims>> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(Error::InvalidArgument("malformed jwt".to_string())),
    };
    let bytes = b64::decode(payload)
        .map_err(|_| Error::InvalidArgument("jwt payload is not base64url".to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| Error::InvalidArgument(format!("unparseable jwt payload: {err}")))
}

fn map_verify_error(err: jwt_simple::Error) -> Error {
    match err.downcast_ref::<JWTError>() {
        Some(JWTError::TokenHasExpired) => Error::TokenExpired,
        _ => Error::InvalidSignature,
    }
}

fn validate_claims(claims: &JWTClaims<FirebaseClaims>, options: &VerifyOptions) -> Result<()> {
    let now = options.now();
    let tolerance = options.time_tolerance_secs;

    let expires_at = claims
        .expires_at
        .map(|at| at.as_secs())
        .ok_or_else(|| Error::InvalidArgument("token has no expiry".to_string()))?;
    if expires_at + tolerance <= now {
        return Err(Error::TokenExpired);
    }

    let issued_at = claims
        .issued_at
        .map(|at| at.as_secs())
        .ok_or_else(|| Error::InvalidArgument("token has no issue time".to_string()))?;
    if issued_at > now + tolerance {
        return Err(Error::InvalidArgument(
            "token issued in the future".to_string(),
        ));
    }
    if let Some(max_age) = options.max_age_secs {
        if now.saturating_sub(issued_at) > max_age + tolerance {
            return Err(Error::TokenExpired);
        }
    }

    if !audience_matches(&claims.audiences, &options.audience) {
        return Err(Error::InvalidArgument(format!(
            "audience does not match {}",
            options.audience
        )));
    }
    if claims.issuer.as_deref() != Some(options.issuer.as_str()) {
        return Err(Error::InvalidArgument(format!(
            "issuer does not match {}",
            options.issuer
        )));
    }

    let subject = claims.subject.as_deref().unwrap_or_default();
    if subject.is_empty() {
        return Err(Error::InvalidArgument("subject is empty".to_string()));
    }
    if claims
        .custom
        .user_id
        .as_deref()
        .is_some_and(|user_id| user_id != subject)
    {
        return Err(Error::InvalidArgument(
            "subject does not match user id".to_string(),
        ));
    }

    if claims.custom.auth_time > now + tolerance {
        return Err(Error::InvalidArgument(
            "authentication time is in the future".to_string(),
        ));
    }

    match (options.tenant_id.as_deref(), claims.custom.tenant()) {
        (None, None) => {}
        (Some(expected), Some(actual)) if expected == actual => {}
        _ => {
            return Err(Error::InvalidArgument(
                "tenant does not match the configured tenant".to_string(),
            ))
        }
    }

    Ok(())
}

pub(crate) fn audience_matches(audiences: &Option<Audiences>, expected: &str) -> bool {
    match audiences {
        Some(Audiences::AsString(audience)) => audience == expected,
        Some(Audiences::AsSet(set)) => set.contains(expected),
        None => false,
    }
}

fn into_decoded(claims: JWTClaims<FirebaseClaims>) -> Result<DecodedIdToken> {
    let subject = claims.subject.clone().unwrap_or_default();
    let audience = match &claims.audiences {
        Some(Audiences::AsString(audience)) => audience.clone(),
        Some(Audiences::AsSet(set)) => set.iter().next().cloned().unwrap_or_default(),
        None => String::new(),
    };
    let tenant_id = claims.custom.tenant().map(str::to_string);
    Ok(DecodedIdToken {
        uid: subject.clone(),
        email: claims.custom.email,
        email_verified: claims.custom.email_verified,
        auth_time: claims.custom.auth_time,
        issued_at: claims.issued_at.map(|at| at.as_secs()).unwrap_or_default(),
        expires_at: claims.expires_at.map(|at| at.as_secs()).unwrap_or_default(),
        audience,
        issuer: claims.issuer.unwrap_or_default(),
        subject,
        tenant_id,
        custom_claims: claims.custom.custom,
    })
}
