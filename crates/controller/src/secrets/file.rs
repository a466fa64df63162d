//! Filesystem-backed secret store
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── _cluster/               # cluster-scoped secrets
//! │   └── letsencrypt-account/
//! │       ├── credentials.json
//! │       └── meta.json
//! └── default/                # one directory per namespace
//!     └── web-tls/
//!         ├── tls.crt         # Certificate chain
//!         ├── tls.key         # Private key (0600)
//!         └── meta.json       # Annotations
//! ```
//!
//! A secret is written into a staging directory first and then renamed
//! into place, so readers never observe a key from one issuance next to
//! a certificate from another.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, trace};

use tessera_common::ResourceKey;

use super::{Secret, SecretStore, SecretStoreError};

const META_FILE: &str = "meta.json";
const CLUSTER_DIR: &str = "_cluster";
const STAGING_SUFFIX: &str = ".staging";

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretMeta {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    updated: Option<chrono::DateTime<chrono::Utc>>,
}

/// Secret store rooted at a directory
#[derive(Debug)]
pub struct FileSecretStore {
    base_path: PathBuf,
}

impl FileSecretStore {
    /// Open (and create if needed) a store at `base_path`.
    ///
    /// The base directory is restricted to the owner (0700 on Unix).
    pub fn new(base_path: &Path) -> Result<Self, SecretStoreError> {
        std::fs::create_dir_all(base_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(base_path, std::fs::Permissions::from_mode(0o700))?;
        }

        info!(storage_path = %base_path.display(), "Initialized secret storage");

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn secret_path(&self, key: &ResourceKey) -> Result<PathBuf, SecretStoreError> {
        let namespace = if key.is_cluster_scoped() {
            CLUSTER_DIR
        } else {
            check_component(key.namespace())?
        };
        Ok(self
            .base_path
            .join(namespace)
            .join(check_component(key.name())?))
    }
}

/// Reject names that would escape the store directory
fn check_component(name: &str) -> Result<&str, SecretStoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('_')
        || name.ends_with(STAGING_SUFFIX)
        || name.contains(['/', '\\', '\0']);
    if bad {
        Err(SecretStoreError::InvalidName(name.to_string()))
    } else {
        Ok(name)
    }
}

async fn set_private(path: &Path) -> Result<(), SecretStoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Secret>, SecretStoreError> {
        let dir = self.secret_path(key)?;
        if !fs::try_exists(&dir).await? {
            trace!(secret = %key, "No stored secret found");
            return Ok(None);
        }

        let mut secret = Secret::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let field = entry.file_name().to_string_lossy().into_owned();
            let content = fs::read(entry.path()).await?;
            if field == META_FILE {
                let meta: SecretMeta = serde_json::from_slice(&content)?;
                secret.annotations = meta.annotations;
            } else {
                secret.data.insert(field, content);
            }
        }

        debug!(secret = %key, fields = secret.data.len(), "Loaded stored secret");
        Ok(Some(secret))
    }

    async fn put(&self, key: &ResourceKey, secret: Secret) -> Result<(), SecretStoreError> {
        let dir = self.secret_path(key)?;
        let parent = dir
            .parent()
            .ok_or_else(|| SecretStoreError::InvalidName(key.to_string()))?;
        fs::create_dir_all(parent).await?;

        let staging = parent.join(format!("{}{}", key.name(), STAGING_SUFFIX));
        if fs::try_exists(&staging).await? {
            fs::remove_dir_all(&staging).await?;
        }
        fs::create_dir_all(&staging).await?;

        for (field, value) in &secret.data {
            if field == META_FILE {
                return Err(SecretStoreError::InvalidName(field.clone()));
            }
            let path = staging.join(check_component(field)?);
            fs::write(&path, value).await?;
            set_private(&path).await?;
        }

        let meta = SecretMeta {
            annotations: secret.annotations,
            updated: Some(chrono::Utc::now()),
        };
        fs::write(staging.join(META_FILE), serde_json::to_vec_pretty(&meta)?).await?;

        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        fs::rename(&staging, &dir).await?;

        info!(secret = %key, fields = secret.data.len(), "Saved secret");
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), SecretStoreError> {
        let dir = self.secret_path(key)?;
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
            info!(secret = %key, "Deleted secret");
        }
        Ok(())
    }
}
