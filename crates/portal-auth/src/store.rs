//! Durable storage for the session's token pair
//!
//! Two named slots (`accessToken`, `refreshToken`) in a small JSON file. All
//! writes use atomic temp-file + rename so a crash never leaves a torn pair
//! on disk. An async RwLock guards the in-memory copy: reads run
//! concurrently, and the write lock is held across the disk write so no
//! reader observes a pair that is only half replaced.
//!
//! The in-memory pair is authoritative for the running process. A failed
//! disk write is reported to the caller but does not roll the pair back.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pair::{AccessToken, RefreshToken, TokenPair};

/// On-disk layout. Either slot missing means "logged out".
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Slots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl Slots {
    fn from_pair(pair: Option<&TokenPair>) -> Self {
        match pair {
            Some(p) => Self {
                access_token: Some(p.access.as_str().to_owned()),
                refresh_token: Some(p.refresh.as_str().to_owned()),
            },
            None => Self::default(),
        }
    }

    fn into_pair(self) -> Option<TokenPair> {
        match (self.access_token, self.refresh_token) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => Some(
                TokenPair::new(AccessToken::new(access), RefreshToken::new(refresh)),
            ),
            (None, None) => None,
            _ => {
                warn!("token file holds an incomplete pair, treating session as logged out");
                None
            }
        }
    }
}

/// Thread-safe holder of the current token pair.
pub struct TokenStore {
    path: Option<PathBuf>,
    state: RwLock<Option<TokenPair>>,
}

impl TokenStore {
    /// Load the pair from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (logged out).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let pair = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading token file: {e}")))?;
            let slots: Slots = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing token file: {e}")))?;
            let pair = slots.into_pair();
            info!(path = %path.display(), logged_in = pair.is_some(), "loaded token file");
            pair
        } else {
            info!(path = %path.display(), "token file not found, starting logged out");
            write_atomic(&path, &Slots::default()).await?;
            None
        };

        Ok(Self {
            path: Some(path),
            state: RwLock::new(pair),
        })
    }

    /// A store that never touches disk. The session ends with the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(None),
        }
    }

    /// In-memory store seeded with a pair.
    pub fn in_memory_with(pair: TokenPair) -> Self {
        Self {
            path: None,
            state: RwLock::new(Some(pair)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshot of the current pair.
    pub async fn get(&self) -> Option<TokenPair> {
        self.state.read().await.clone()
    }

    pub async fn access_token(&self) -> Option<AccessToken> {
        self.state.read().await.as_ref().map(|p| p.access.clone())
    }

    pub async fn is_logged_in(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Replace the pair wholesale and persist.
    pub async fn set(&self, pair: TokenPair) -> Result<()> {
        let mut state = self.state.write().await;
        *state = Some(pair);
        debug!("token pair replaced");
        self.persist(state.as_ref()).await
    }

    /// Drop both tokens and persist the empty slots.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        *state = None;
        debug!("token pair cleared");
        self.persist(None).await
    }

    /// Replace the pair (or clear it, for `None`) only while the stored
    /// access token is still `current`. Returns whether the swap happened.
    ///
    /// An `Err` means the swap happened in memory but could not be persisted.
    pub async fn replace_if(&self, current: &AccessToken, next: Option<TokenPair>) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.as_ref().map(|p| &p.access) != Some(current) {
            debug!("token pair changed concurrently, replacement skipped");
            return Ok(false);
        }
        *state = next;
        self.persist(state.as_ref()).await?;
        Ok(true)
    }

    async fn persist(&self, pair: Option<&TokenPair>) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, &Slots::from_pair(pair)).await,
            None => Ok(()),
        }
    }
}

/// Write the slots to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains bearer credentials.
async fn write_atomic(path: &Path, slots: &Slots) -> Result<()> {
    let json = serde_json::to_string_pretty(slots)
        .map_err(|e| Error::CredentialParse(format!("serializing token file: {e}")))?;

    let tmp_path = temp_path_for(path)?;

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted token file");
    Ok(())
}

/// Sibling of `path`, unique per target file and process.
fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token file path has no parent directory".into()))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Io("token file path has no file name".into()))?;
    Ok(dir.join(format!(
        ".{}.tmp.{}",
        name.to_string_lossy(),
        std::process::id()
    )))
}
