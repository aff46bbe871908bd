//! Identity resolution for per-identity rate limiting.
//!
//! The limiter tracks logical principals, not connections. When the host has
//! an authenticated session, the principal comes out of the access token's
//! `sub` claim; otherwise a generated session id is persisted through the
//! host's key-value storage so an anonymous client keeps one identity across
//! restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Minimal key-value storage seam (browser local storage, a dotfile, an
/// embedded store). Only strings, only point lookups.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str);
}

/// In-memory [`KeyValueStore`] for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().expect("kv store lock").get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .expect("kv store lock")
            .insert(key.to_string(), value.to_string());
    }
}

/// Resolves the identity the rate limiter should charge a call to.
pub trait IdentityResolver: Send + Sync {
    fn identity(&self) -> String;
}

const TOKEN_KEY: &str = "auth_token";
const SESSION_KEY: &str = "session_id";

/// Default resolver: token subject when a token is stored, otherwise a
/// generated `anon-` session id persisted under [`SESSION_KEY`].
pub struct SessionIdentity {
    store: Arc<dyn KeyValueStore>,
}

impl SessionIdentity {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn session_id(&self) -> String {
        if let Some(existing) = self.store.get(SESSION_KEY) {
            return existing;
        }
        let generated = format!("anon-{:016x}", rand::random::<u64>());
        self.store.put(SESSION_KEY, &generated);
        debug!(session_id = %generated, "generated anonymous session identity");
        generated
    }
}

impl IdentityResolver for SessionIdentity {
    fn identity(&self) -> String {
        match self.store.get(TOKEN_KEY).as_deref().and_then(token_subject) {
            Some(subject) => subject,
            None => self.session_id(),
        }
    }
}

/// Pulls the `sub` claim out of a JWT-shaped token without verifying it.
/// Verification is the server's job; this only needs a stable label.
fn token_subject(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("sub")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_token(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.")
    }

    #[test]
    fn token_subject_wins_over_session_id() {
        let store = Arc::new(MemoryKeyValueStore::default());
        store.put(TOKEN_KEY, &encode_token(&serde_json::json!({"sub": "user-17"})));
        let resolver = SessionIdentity::new(store);
        assert_eq!(resolver.identity(), "user-17");
    }

    #[test]
    fn anonymous_identity_is_stable_across_lookups() {
        let store = Arc::new(MemoryKeyValueStore::default());
        let resolver = SessionIdentity::new(Arc::clone(&store) as Arc<dyn KeyValueStore>);
        let first = resolver.identity();
        let second = resolver.identity();
        assert!(first.starts_with("anon-"));
        assert_eq!(first, second);
        assert_eq!(store.get(SESSION_KEY), Some(first));
    }

    #[test]
    fn malformed_tokens_fall_back_to_session_identity() {
        let store = Arc::new(MemoryKeyValueStore::default());
        store.put(TOKEN_KEY, "not-a-jwt");
        let resolver = SessionIdentity::new(store);
        assert!(resolver.identity().starts_with("anon-"));
    }
}
