//! Local user records keyed by provider identity
//!
//! A JSON file maps `"{provider}:{provider_user_id}"` to the last canonical
//! profile seen for that identity. Writes go through a temp file and a rename
//! so a crash mid-write never leaves a truncated file. A tokio Mutex
//! serializes concurrent sign-ins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::profile::CanonicalProfile;

/// A user known to the gateway.
///
/// Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Configured provider name the identity belongs to.
    pub provider: String,
    pub profile: CanonicalProfile,
    pub created_at: u64,
    pub last_login_at: u64,
}

impl UserRecord {
    pub fn key(&self) -> String {
        user_key(&self.provider, &self.profile.provider_user_id)
    }
}

/// Storage key for a provider identity.
pub fn user_key(provider: &str, provider_user_id: &str) -> String {
    format!("{provider}:{provider_user_id}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// File-backed user store.
pub struct UserStore {
    path: PathBuf,
    state: Mutex<HashMap<String, UserRecord>>,
}

impl UserStore {
    /// Load users from `path`, creating an empty file on first start.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading user file: {e}")))?;
            let users: HashMap<String, UserRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::UserParse(format!("parsing user file: {e}")))?;
            info!(path = %path.display(), users = users.len(), "loaded users");
            users
        } else {
            info!(path = %path.display(), "user file not found, starting with empty store");
            let users = HashMap::new();
            write_atomic(&path, &users).await?;
            users
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Create or refresh the record for a signed-in identity.
    ///
    /// The profile is replaced with the latest one from the provider;
    /// `created_at` survives across sign-ins.
    pub async fn upsert(&self, provider: &str, profile: CanonicalProfile) -> Result<UserRecord> {
        let now = now_millis();
        let key = user_key(provider, &profile.provider_user_id);

        let mut state = self.state.lock().await;
        let created = !state.contains_key(&key);
        let record = match state.get(&key) {
            Some(existing) => UserRecord {
                profile,
                last_login_at: now,
                ..existing.clone()
            },
            None => UserRecord {
                provider: provider.to_string(),
                profile,
                created_at: now,
                last_login_at: now,
            },
        };

        // Memory only moves forward once the file does.
        let previous = state.insert(key.clone(), record.clone());
        if let Err(e) = write_atomic(&self.path, &state).await {
            match previous {
                Some(previous) => state.insert(key, previous),
                None => state.remove(&key),
            };
            return Err(e);
        }

        if created {
            info!(user = %key, "created user");
        } else {
            debug!(user = %key, "updated user");
        }
        Ok(record)
    }

    #[cfg(test)]
    pub async fn get(&self, provider: &str, provider_user_id: &str) -> Option<UserRecord> {
        let state = self.state.lock().await;
        state.get(&user_key(provider, provider_user_id)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write the user map atomically with 0600 permissions (profiles hold
/// personal data).
async fn write_atomic(path: &Path, data: &HashMap<String, UserRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::UserParse(format!("serializing users: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        Some(_) => Path::new("."),
        None => return Err(Error::Io("user file path has no parent directory".into())),
    };

    let tmp_path = dir.join(format!(".users.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp user file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting user file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp user file: {e}")))?;

    debug!(path = %path.display(), "persisted users");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, email: &str) -> CanonicalProfile {
        CanonicalProfile {
            provider_user_id: id.into(),
            email: email.into(),
            display_name: "Jane Doe".into(),
            given_name: "Jane".into(),
            family_name: "Doe".into(),
            tenant_id: None,
            profile_picture_url: None,
        }
    }

    #[tokio::test]
    async fn upsert_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let store = UserStore::load(path.clone()).await.unwrap();
        let record = store.upsert("azure", profile("abc-123", "jane@x.com")).await.unwrap();
        assert_eq!(record.key(), "azure:abc-123");

        let reloaded = UserStore::load(path).await.unwrap();
        let user = reloaded.get("azure", "abc-123").await.unwrap();
        assert_eq!(user.profile.email, "jane@x.com");
        assert_eq!(user.provider, "azure");
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        assert!(!path.exists());
        let store = UserStore::load(path.clone()).await.unwrap();
        assert!(store.is_empty().await);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, UserRecord> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn second_sign_in_updates_profile_and_keeps_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::load(dir.path().join("users.json")).await.unwrap();

        let first = store.upsert("google", profile("1", "old@x.com")).await.unwrap();
        let second = store.upsert("google", profile("1", "new@x.com")).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_login_at >= first.last_login_at);
        assert_eq!(second.profile.email, "new@x.com");
    }

    #[tokio::test]
    async fn same_subject_on_different_providers_are_distinct_users() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::load(dir.path().join("users.json")).await.unwrap();

        store.upsert("google", profile("1", "a@x.com")).await.unwrap();
        store.upsert("authentik", profile("1", "a@x.com")).await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        tokio::fs::create_dir(&data_dir).await.unwrap();
        let store = UserStore::load(data_dir.join("users.json")).await.unwrap();
        let first = store.upsert("google", profile("1", "old@x.com")).await.unwrap();

        tokio::fs::remove_dir_all(&data_dir).await.unwrap();

        let err = store.upsert("google", profile("1", "new@x.com")).await.err().unwrap();
        assert!(matches!(err, Error::Io(_)), "got: {err}");
        assert!(store.upsert("google", profile("2", "b@x.com")).await.is_err());

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("google", "1").await.unwrap(), first);
        assert!(store.get("google", "2").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = UserStore::load(path).await.err().unwrap();
        assert!(matches!(err, Error::UserParse(_)), "got: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = UserStore::load(path.clone()).await.unwrap();
        store.upsert("google", profile("1", "a@x.com")).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "user file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_sign_ins_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = std::sync::Arc::new(UserStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert("google", profile(&i.to_string(), &format!("u{i}@x.com")))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.len().await, 10);
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, UserRecord> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
