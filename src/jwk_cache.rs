use crate::error::{Error, Result};
use jwt_simple::prelude::RS256PublicKey;
use reqwest::header::CACHE_CONTROL;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const BODY_EXCERPT_LEN: usize = 200;

/// Process-wide cache of verification keys, one entry per key-set URL.
///
/// Entries are refreshed lazily on lookup once their `Cache-Control`
/// max-age has elapsed; a response without a parseable max-age is treated
/// as immediately stale. Concurrent lookups for the same URL may fetch
/// twice; the last write wins and the swapped-in set is always complete.
pub struct KeyCache {
    client: reqwest::Client,
    sets: RwLock<HashMap<String, CachedKeySet>>,
}

#[derive(Clone)]
struct CachedKeySet {
    keys: Arc<HashMap<String, RS256PublicKey>>,
    expires_at_millis: u64,
}

impl KeyCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            sets: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, url: &str) -> Result<Arc<HashMap<String, RS256PublicKey>>> {
        let now = crate::unix_millis();
        if let Some(set) = self.sets.read().await.get(url) {
            if set.expires_at_millis > now {
                return Ok(set.keys.clone());
            }
        }

        let (keys, max_age_secs) = fetch_key_set(&self.client, url).await?;
        let keys = Arc::new(keys);
        let expires_at_millis = max_age_secs.map_or(0, |secs| now + secs * 1000);
        self.sets.write().await.insert(
            url.to_string(),
            CachedKeySet {
                keys: keys.clone(),
                expires_at_millis,
            },
        );
        Ok(keys)
    }

    /// Drop every cached set. Test hook; also usable after a known key
    /// rotation.
    pub async fn reset(&self) {
        self.sets.write().await.clear();
    }
}

async fn fetch_key_set(
    client: &reqwest::Client,
    url: &str,
) -> Result<(HashMap<String, RS256PublicKey>, Option<u64>)> {
    let response = client.get(url).send().await.inspect_err(|err| {
        tracing::warn!(?err, url, "failed to retrieve public key set");
    })?;

    let status = response.status();
    let max_age_secs = parse_max_age(&response);
    let body = response.text().await?;
    if !status.is_success() {
        return Err(Error::JwksFetchFailed {
            status: status.as_u16(),
            body: excerpt(&body),
        });
    }

    let pem_by_kid: HashMap<String, String> =
        serde_json::from_str(&body).map_err(|_| Error::JwksFetchFailed {
            status: status.as_u16(),
            body: excerpt(&body),
        })?;

    let keys = pem_by_kid
        .into_iter()
        .try_fold(HashMap::new(), |mut set, (key_id, pem)| {
            let public_key = RS256PublicKey::from_pem(&pem).map_err(|err| {
                Error::Internal(format!("unusable public key {key_id}: {err}"))
            })?;
            tracing::debug!(key_id = %key_id, "adding public key to verification cache");
            set.insert(key_id, public_key);
            Ok::<_, Error>(set)
        })?;
    Ok((keys, max_age_secs))
}

fn parse_max_age(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CACHE_CONTROL)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| {
            header.split(',').find_map(|directive| {
                let (name, value) = directive.trim().split_once('=')?;
                if name.trim().eq_ignore_ascii_case("max-age") {
                    value.trim().parse().ok()
                } else {
                    None
                }
            })
        })
}

fn excerpt(body: &str) -> String {
    let mut excerpt = String::with_capacity(BODY_EXCERPT_LEN);
    excerpt.extend(body.chars().take(BODY_EXCERPT_LEN));
    excerpt
}
