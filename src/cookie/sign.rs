use crate::b64;
use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs cookie payloads under a rotating key list. The head key signs;
/// every key in the list is accepted during verification, so rotation is
/// prepending a new head and trimming the tail once old cookies have aged
/// out.
#[derive(Clone, Debug)]
pub struct CookieSigner {
    keys: Vec<Vec<u8>>,
}

impl CookieSigner {
    pub fn new(keys: &[String]) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one cookie signature key is required".to_string(),
            ));
        }
        Ok(Self {
            keys: keys.iter().map(|key| key.as_bytes().to_vec()).collect(),
        })
    }

    /// `base64url(payload) + "." + base64url(hmac_sha256(base64url(payload)))`
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let payload_b64 = b64::encode(payload);
        let signature = mac_digest(&self.keys[0], payload_b64.as_bytes())?;
        Ok(format!("{payload_b64}.{}", b64::encode(signature)))
    }

    /// Returns the payload bytes when the signature matches any accepted
    /// key. The comparison is constant-time per key.
    pub fn verify(&self, value: &str) -> Result<Vec<u8>> {
        let (payload_b64, signature_b64) = value.rsplit_once('.').ok_or_else(malformed)?;
        let signature = b64::decode(signature_b64).map_err(|_| malformed())?;

        for key in &self.keys {
            let mut mac = HmacSha256::new_from_slice(key)
                .map_err(|err| Error::Internal(err.to_string()))?;
            mac.update(payload_b64.as_bytes());
            if mac.verify_slice(&signature).is_ok() {
                return b64::decode(payload_b64).map_err(|_| malformed());
            }
        }
        Err(Error::InvalidSignature)
    }
}

fn mac_digest(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|err| Error::Internal(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn malformed() -> Error {
    Error::InvalidCredential("malformed session cookie".to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn sign_verify_round_trip() {
        let signer = CookieSigner::new(&keys(&["secret-1"])).expect("signer");
        let cookie = signer.sign(b"{\"idToken\":\"abc\"}").expect("signed");
        let payload = signer.verify(&cookie).expect("verifies");
        assert_eq!(payload, b"{\"idToken\":\"abc\"}");
    }

    #[test]
    fn rotated_tail_key_still_verifies() {
        let old = CookieSigner::new(&keys(&["k-old"])).expect("signer");
        let cookie = old.sign(b"payload").expect("signed");

        let rotated = CookieSigner::new(&keys(&["k-new", "k-old"])).expect("signer");
        assert_eq!(rotated.verify(&cookie).expect("verifies"), b"payload");
    }

    #[test]
    fn removed_key_invalidates_old_cookies() {
        let older = CookieSigner::new(&keys(&["k-older"])).expect("signer");
        let cookie = older.sign(b"payload").expect("signed");

        let rotated = CookieSigner::new(&keys(&["k-new", "k-old"])).expect("signer");
        let err = rotated.verify(&cookie).expect_err("rejected");
        assert_eq!(err.code(), "INVALID_SIGNATURE");
    }

    #[test]
    fn malformed_input_is_an_invalid_credential() {
        let signer = CookieSigner::new(&keys(&["secret-1"])).expect("signer");
        assert_eq!(
            signer.verify("no-dot-here").expect_err("rejected").code(),
            "INVALID_CREDENTIAL"
        );
        assert_eq!(
            signer
                .verify("payload.!!not-base64!!")
                .expect_err("rejected")
                .code(),
            "INVALID_CREDENTIAL"
        );
    }

    #[test]
    fn empty_key_list_is_rejected() {
        let err = CookieSigner::new(&[]).expect_err("rejected");
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }
}
