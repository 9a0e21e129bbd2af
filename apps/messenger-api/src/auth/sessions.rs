//! Session tokens issued by the login flow, stored by hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

/// Session TTL in seconds (30 days).
pub const SESSION_TTL_SECS: u64 = 30 * 24 * 3600;

/// Data stored alongside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub user_id: String,
}

/// Raw tokens never reach the store; only their SHA-256 does.
fn session_key(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("messenger:session:{hex}")
}

pub async fn store_session(kv: &dyn KeyValueStore, token: &str, data: &SessionData) -> Result<(), ApiError> {
    let value = serde_json::to_string(data).map_err(|_| ApiError::internal("serialization"))?;
    kv.set_ex(&session_key(token), &value, SESSION_TTL_SECS).await
}

pub async fn lookup_session(kv: &dyn KeyValueStore, token: &str) -> Result<Option<SessionData>, ApiError> {
    match kv.get(&session_key(token)).await? {
        Some(v) => {
            let data: SessionData =
                serde_json::from_str(&v).map_err(|_| ApiError::internal("corrupt session data"))?;
            Ok(Some(data))
        }
        None => Ok(None),
    }
}

pub async fn revoke_session(kv: &dyn KeyValueStore, token: &str) -> Result<(), ApiError> {
    kv.del(&session_key(token)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    #[test]
    fn key_is_hashed() {
        let key = session_key("secret-token");
        assert!(key.starts_with("messenger:session:"));
        assert!(!key.contains("secret-token"));
        assert_eq!(key.len(), "messenger:session:".len() + 64);
        assert_eq!(key, session_key("secret-token"));
    }

    #[tokio::test]
    async fn store_lookup_revoke() {
        let kv = MemoryStore::new();
        let data = SessionData {
            user_id: "usr_1".into(),
        };

        store_session(&kv, "tok", &data).await.unwrap();
        assert_eq!(lookup_session(&kv, "tok").await.unwrap(), Some(data));
        assert_eq!(lookup_session(&kv, "other").await.unwrap(), None);

        revoke_session(&kv, "tok").await.unwrap();
        assert_eq!(lookup_session(&kv, "tok").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let kv = MemoryStore::new();
        kv.set_ex(&session_key("tok"), "not json", 60).await.unwrap();
        assert!(lookup_session(&kv, "tok").await.is_err());
    }
}
