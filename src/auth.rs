//! Principals and authentication backends.
//!
//! The engine only ever sees a [`Principal`]. How it was obtained is the
//! business of [`AuthBackend`].

use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{AuthBackendKind, AuthConfig};
use crate::db::{Store, User};
use crate::error::{IpamError, Result};

/// The identity an operation runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Who the change is attributed to.
    pub identity: String,
    /// Who actually authenticated. Differs from `identity` only when a
    /// trusted principal acts on behalf of someone else.
    pub authenticated_as: String,
    pub full_name: Option<String>,
    pub authoritative_source: String,
    pub trusted: bool,
    pub readonly: bool,
}

impl Principal {
    pub fn new(identity: impl Into<String>, authoritative_source: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            authenticated_as: identity.clone(),
            identity,
            full_name: None,
            authoritative_source: authoritative_source.into(),
            trusted: false,
            readonly: false,
        }
    }

    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }

    pub fn with_trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Act as `identity`. Only trusted principals may do this; the
    /// authenticated name is kept for the audit trail.
    pub fn on_behalf_of(&self, identity: &str, full_name: Option<&str>) -> Result<Principal> {
        if !self.trusted {
            return Err(IpamError::Unauthorized(format!(
                "'{}' is not trusted to act on behalf of '{}'",
                self.authenticated_as, identity
            )));
        }
        Ok(Principal {
            identity: identity.to_string(),
            authenticated_as: self.authenticated_as.clone(),
            full_name: full_name.map(str::to_string),
            authoritative_source: self.authoritative_source.clone(),
            trusted: self.trusted,
            readonly: self.readonly,
        })
    }

    /// Refuse mutations from read-only principals.
    pub fn require_write(&self) -> Result<()> {
        if self.readonly {
            return Err(IpamError::ReadOnly(self.identity.clone()));
        }
        Ok(())
    }
}

/// Hash a password with the given salt using SHA-256.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new random salt.
pub fn generate_salt() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Stored form: `salt$hash`.
fn encode_credential(password: &str) -> String {
    let salt = generate_salt();
    format!("{}${}", salt, hash_password(&salt, password))
}

fn verify_credential(stored: &str, password: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, hash)) => hash_password(salt, password) == hash,
        None => false,
    }
}

/// Users kept in the local `users` table.
#[derive(Debug, Clone)]
pub struct LocalAuth {
    store: Store,
    source: String,
}

impl LocalAuth {
    pub fn new(store: Store, source: impl Into<String>) -> Self {
        Self {
            store,
            source: source.into(),
        }
    }

    pub async fn add_user(
        &self,
        username: &str,
        password: &str,
        full_name: Option<&str>,
        trusted: bool,
        readonly: bool,
    ) -> Result<User> {
        if username.trim().is_empty() {
            return Err(IpamError::MissingInput("username".into()));
        }
        if password.is_empty() {
            return Err(IpamError::MissingInput("password".into()));
        }
        let user = User {
            username: username.to_string(),
            full_name: full_name.map(str::to_string),
            trusted,
            readonly,
            created_at: Utc::now(),
        };
        self.store.create_user(&user, &encode_credential(password)).await?;
        Ok(user)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.store.list_users().await
    }

    pub async fn remove_user(&self, username: &str) -> Result<()> {
        if !self.store.remove_user(username).await? {
            return Err(IpamError::not_found("user", username));
        }
        Ok(())
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Principal> {
        let found = self.store.get_user(username).await?;
        match found {
            Some((user, stored)) if verify_credential(&stored, password) => {
                debug!(username, "Authenticated local user");
                let mut p = Principal::new(&user.username, &self.source)
                    .with_trusted(user.trusted)
                    .with_readonly(user.readonly);
                p.full_name = user.full_name;
                Ok(p)
            }
            _ => {
                warn!(username, "Local authentication failed");
                Err(IpamError::Unauthorized("invalid username or password".into()))
            }
        }
    }
}

/// What a directory bind yields for a valid user.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEntry {
    pub full_name: Option<String>,
    pub groups: Vec<String>,
}

/// Directory bind capability supplied by the embedding program.
///
/// `Ok(None)` means the credentials were rejected; `Err` means the
/// directory could not be asked.
pub trait DirectoryBind: Send + Sync {
    fn bind(&self, username: &str, password: &str) -> std::result::Result<Option<DirectoryEntry>, String>;
}

/// Authentication against an external directory, with group-based roles.
#[derive(Clone)]
pub struct DirectoryAuth {
    directory: Arc<dyn DirectoryBind>,
    source: String,
    rw_group: Option<String>,
    ro_group: Option<String>,
    trusted_group: Option<String>,
}

impl std::fmt::Debug for DirectoryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryAuth")
            .field("source", &self.source)
            .field("rw_group", &self.rw_group)
            .field("ro_group", &self.ro_group)
            .field("trusted_group", &self.trusted_group)
            .finish_non_exhaustive()
    }
}

impl DirectoryAuth {
    pub fn new(directory: Arc<dyn DirectoryBind>, config: &AuthConfig) -> Self {
        Self {
            directory,
            source: config.default_source.clone(),
            rw_group: config.rw_group.clone(),
            ro_group: config.ro_group.clone(),
            trusted_group: config.trusted_group.clone(),
        }
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Principal> {
        let directory = Arc::clone(&self.directory);
        let (user, pass) = (username.to_string(), password.to_string());
        let entry = tokio::task::spawn_blocking(move || directory.bind(&user, &pass))
            .await
            .map_err(|e| IpamError::Internal(format!("directory bind task: {e}")))?
            .map_err(|e| {
                warn!(error = %e, "Directory unavailable");
                IpamError::Unauthorized("directory unavailable".into())
            })?
            .ok_or_else(|| {
                warn!(username, "Directory authentication failed");
                IpamError::Unauthorized("invalid username or password".into())
            })?;

        self.principal_for(username, entry)
    }

    fn principal_for(&self, username: &str, entry: DirectoryEntry) -> Result<Principal> {
        let member = |g: &Option<String>| g.as_ref().is_some_and(|g| entry.groups.contains(g));

        let readonly = if member(&self.rw_group) {
            false
        } else if member(&self.ro_group) {
            true
        } else {
            return Err(IpamError::Unauthorized(format!(
                "'{username}' is not in an authorized group"
            )));
        };

        let mut p = Principal::new(username, &self.source)
            .with_trusted(member(&self.trusted_group))
            .with_readonly(readonly);
        p.full_name = entry.full_name;
        Ok(p)
    }
}

/// The configured way of turning credentials into a [`Principal`].
#[derive(Debug, Clone)]
pub enum AuthBackend {
    Local(LocalAuth),
    Directory(DirectoryAuth),
}

impl AuthBackend {
    /// Build the backend named in `config`. A directory backend needs the
    /// embedding program to supply the bind capability.
    pub fn from_config(
        config: &AuthConfig,
        store: Store,
        directory: Option<Arc<dyn DirectoryBind>>,
    ) -> Result<Self> {
        match config.backend {
            AuthBackendKind::Local => Ok(AuthBackend::Local(LocalAuth::new(
                store,
                &config.default_source,
            ))),
            AuthBackendKind::Directory => {
                let directory = directory.ok_or_else(|| {
                    IpamError::MissingInput("directory bind for the directory auth backend".into())
                })?;
                Ok(AuthBackend::Directory(DirectoryAuth::new(directory, config)))
            }
        }
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Principal> {
        match self {
            AuthBackend::Local(local) => local.authenticate(username, password).await,
            AuthBackend::Directory(dir) => dir.authenticate(username, password).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_hash_password() {
        let a = hash_password("salt", "secret");
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_password("pepper", "secret"));
        assert!(verify_credential(&format!("salt${a}"), "secret"));
        assert!(!verify_credential(&format!("salt${a}"), "wrong"));
        assert!(!verify_credential("garbage", "secret"));
    }

    #[test]
    fn test_generate_salt() {
        let a = generate_salt();
        let b = generate_salt();
        assert_ne!(a, b);
        assert!(!a.contains('$'));
    }

    #[test]
    fn test_on_behalf_of() {
        let untrusted = Principal::new("bob", "web");
        let err = untrusted.on_behalf_of("alice", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let trusted = Principal::new("provisioner", "automation").with_trusted(true);
        let acting = trusted.on_behalf_of("alice", Some("Alice A.")).unwrap();
        assert_eq!(acting.identity, "alice");
        assert_eq!(acting.authenticated_as, "provisioner");
        assert_eq!(acting.authoritative_source, "automation");
    }

    #[test]
    fn test_readonly_refuses_writes() {
        let p = Principal::new("viewer", "web").with_readonly(true);
        assert!(matches!(p.require_write(), Err(IpamError::ReadOnly(_))));
        assert!(Principal::new("admin", "web").require_write().is_ok());
    }

    #[tokio::test]
    async fn test_local_auth() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("auth.db"), 1).await.unwrap();
        let auth = AuthBackend::from_config(&AuthConfig::default(), store.clone(), None).unwrap();
        let AuthBackend::Local(local) = &auth else {
            panic!("expected local backend");
        };

        local.add_user("alice", "s3cret", Some("Alice"), false, true).await.unwrap();
        let dup = local.add_user("alice", "other", None, false, false).await.unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::Constraint);

        let p = auth.authenticate("alice", "s3cret").await.unwrap();
        assert_eq!(p.identity, "alice");
        assert!(p.readonly);
        assert_eq!(p.authoritative_source, "prefixd");
        assert_eq!(p.full_name.as_deref(), Some("Alice"));

        let err = auth.authenticate("alice", "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        local.remove_user("alice").await.unwrap();
        assert!(local.list_users().await.unwrap().is_empty());
        assert_eq!(local.remove_user("alice").await.unwrap_err().kind(), ErrorKind::NonExistent);
    }

    struct FakeDirectory;

    impl DirectoryBind for FakeDirectory {
        fn bind(&self, username: &str, password: &str) -> std::result::Result<Option<DirectoryEntry>, String> {
            match (username, password) {
                ("ops", "pw") => Ok(Some(DirectoryEntry {
                    full_name: Some("Ops Person".into()),
                    groups: vec!["netops".into(), "automation".into()],
                })),
                ("guest", "pw") => Ok(Some(DirectoryEntry {
                    full_name: None,
                    groups: vec!["viewers".into()],
                })),
                ("nobody", "pw") => Ok(Some(DirectoryEntry::default())),
                ("down", _) => Err("connection refused".into()),
                _ => Ok(None),
            }
        }
    }

    #[tokio::test]
    async fn test_directory_auth_groups() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("auth.db"), 1).await.unwrap();
        let config = AuthConfig {
            backend: AuthBackendKind::Directory,
            rw_group: Some("netops".into()),
            ro_group: Some("viewers".into()),
            trusted_group: Some("automation".into()),
            ..Default::default()
        };
        assert!(AuthBackend::from_config(&config, store.clone(), None).is_err());

        let auth = AuthBackend::from_config(&config, store, Some(Arc::new(FakeDirectory))).unwrap();

        let ops = auth.authenticate("ops", "pw").await.unwrap();
        assert!(ops.trusted);
        assert!(!ops.readonly);

        let guest = auth.authenticate("guest", "pw").await.unwrap();
        assert!(guest.readonly);
        assert!(!guest.trusted);

        for (user, pass) in [("nobody", "pw"), ("ops", "bad"), ("down", "pw")] {
            let err = auth.authenticate(user, pass).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Authorization);
        }
    }
}
