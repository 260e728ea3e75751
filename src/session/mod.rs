//! Session store: persisted conversation state keyed by an external
//! correlation id.
//!
//! Layout under the sessions directory:
//!
//! ```text
//! live/<id>/session.json   live session
//! locks/<id>.lock          advisory lock guarding check-then-create and appends
//! archive/<id>.json        expired session, full history
//! ```
//!
//! Each kind of file has its own root, so no session id can name another
//! session's archive. Sessions are never deleted. Expiry moves the document
//! into `archive/`, and a later request for the same id revives it.
//!
//! File work runs on the blocking pool; only lock polling stays async.

use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::SessionSettings;
use crate::errors::SessionError;
use crate::sanitize::{normalize_identifier, short_hash, validate_identifier};
use crate::util::{read_json, write_json_atomic};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
const CONTENT_ID_HASH_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl SessionMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    /// The untrusted id as supplied, kept for audit only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<SessionMessage>,
    /// Identifies the writer that last held the session lock.
    pub lock_token: String,
}

/// Result of [`SessionStore::get_or_create`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub created: bool,
    /// Set when the lock could not be acquired and a fresh id was issued.
    pub degraded: bool,
    pub state: SessionState,
}

/// Held advisory lock; released when dropped.
struct SessionLock {
    _file: File,
    token: String,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    lock_timeout: Duration,
    max_id_len: usize,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>, settings: &SessionSettings) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout: settings.lock_timeout(),
            max_id_len: settings.max_id_len,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn live_dir(&self) -> PathBuf {
        self.dir.join("live")
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.live_dir().join(id).join("session.json")
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join("locks").join(format!("{}.lock", id))
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.dir.join("archive").join(format!("{}.json", id))
    }

    /// Map a correlation id (or, without one, the seed content) to a session id.
    ///
    /// Content-derived ids depend on the seed alone so identical requests
    /// land on the same session.
    pub fn session_id_for(
        &self,
        correlation_id: Option<&str>,
        seed: &str,
    ) -> Result<String, SessionError> {
        match correlation_id.filter(|c| !c.is_empty()) {
            Some(raw) => Ok(normalize_identifier(
                "correlation id",
                raw,
                self.max_id_len,
            )?),
            None => Ok(format!("c-{}", short_hash(seed, CONTENT_ID_HASH_LEN))),
        }
    }

    /// Run `f` on the blocking thread pool with a clone of the store.
    async fn blocking<F, R>(&self, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&SessionStore) -> Result<R, SessionError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .context("Session task panicked")?
    }

    fn open_lock_file(&self, id: &str) -> Result<File, SessionError> {
        let path = self.lock_path(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open session lock {}", path.display()))?;
        Ok(file)
    }

    /// Poll for the session's advisory lock until the configured timeout.
    async fn lock(&self, id: &str) -> Result<Option<SessionLock>, SessionError> {
        let owned = id.to_string();
        let file = self.blocking(move |s| s.open_lock_file(&owned)).await?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(Some(SessionLock {
                        _file: file,
                        token: uuid::Uuid::new_v4().simple().to_string(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to lock {}", self.lock_path(id).display()))
                        .into());
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Return the session for `correlation_id`, creating it on first use,
    /// and append `seed` as a user message.
    ///
    /// Concurrent calls for the same id serialize on the session lock and
    /// all land in one history. If the lock cannot be taken in time a
    /// fresh random session is issued instead.
    pub async fn get_or_create(
        &self,
        correlation_id: Option<&str>,
        seed: &str,
    ) -> Result<SessionHandle, SessionError> {
        let id = self.session_id_for(correlation_id, seed)?;

        let Some(lock) = self.lock(&id).await? else {
            let fallback = format!("r-{}", uuid::Uuid::new_v4().simple());
            tracing::warn!(
                session = %id,
                fallback = %fallback,
                timeout_ms = self.lock_timeout.as_millis() as u64,
                "Session lock timed out; issuing a fresh session"
            );
            let state = new_state(&fallback, correlation_id, seed, "unlocked");
            let (path, doc) = (self.session_path(&fallback), state.clone());
            self.blocking(move |_| Ok(write_json_atomic(&path, &doc)?))
                .await?;
            return Ok(SessionHandle {
                session_id: fallback,
                created: true,
                degraded: true,
                state,
            });
        };

        let correlation_id = correlation_id.map(str::to_string);
        let seed = seed.to_string();
        let key = id.clone();
        let (state, created) = self
            .blocking(move |s| {
                let existing = match read_json::<SessionState>(&s.session_path(&key))? {
                    Some(state) => Some(state),
                    None => s.revive(&key)?,
                };
                let (mut state, created) = match existing {
                    Some(state) => (state, false),
                    None => (
                        new_state(&key, correlation_id.as_deref(), &seed, &lock.token),
                        true,
                    ),
                };
                if !created {
                    state.messages.push(SessionMessage::new("user", &seed));
                    state.updated_at = Utc::now();
                    state.lock_token = lock.token.clone();
                }
                write_json_atomic(&s.session_path(&key), &state)?;
                drop(lock);
                Ok((state, created))
            })
            .await?;

        tracing::debug!(session = %id, created, messages = state.messages.len(), "Session resolved");
        Ok(SessionHandle {
            session_id: id,
            created,
            degraded: false,
            state,
        })
    }

    fn revive(&self, id: &str) -> Result<Option<SessionState>, SessionError> {
        let archived = read_json::<SessionState>(&self.archive_path(id))?;
        if archived.is_some() {
            tracing::info!(session = %id, "Reviving archived session");
        }
        Ok(archived)
    }

    pub fn get(&self, session_id: &str) -> Result<SessionState, SessionError> {
        validate_identifier("session id", session_id)?;
        read_json(&self.session_path(session_id))?.ok_or_else(|| SessionError::NotFound {
            id: session_id.to_string(),
        })
    }

    /// Append a message under the session lock.
    pub async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<SessionState, SessionError> {
        validate_identifier("session id", session_id)?;
        validate_identifier("message role", role)?;
        let started = Instant::now();
        let Some(lock) = self.lock(session_id).await? else {
            return Err(SessionError::LockTimeout {
                id: session_id.to_string(),
                waited_ms: started.elapsed().as_millis(),
            });
        };
        let id = session_id.to_string();
        let (role, content) = (role.to_string(), content.to_string());
        self.blocking(move |s| {
            let mut state = match read_json::<SessionState>(&s.session_path(&id))? {
                Some(state) => state,
                None => s
                    .revive(&id)?
                    .ok_or_else(|| SessionError::NotFound { id: id.clone() })?,
            };
            state.messages.push(SessionMessage::new(&role, &content));
            state.updated_at = Utc::now();
            state.lock_token = lock.token.clone();
            write_json_atomic(&s.session_path(&id), &state)?;
            drop(lock);
            Ok(state)
        })
        .await
    }

    /// Move sessions idle for longer than `max_age` into the archive.
    ///
    /// Sessions whose lock is held are skipped. Returns the archived ids.
    pub async fn archive_expired(&self, max_age: Duration) -> Result<Vec<String>, SessionError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let candidates = self.blocking(move |s| s.idle_sessions(cutoff)).await?;

        let mut archived = Vec::new();
        for id in candidates {
            let Some(lock) = self.lock(&id).await? else {
                tracing::debug!(session = %id, "Session busy; not archiving");
                continue;
            };
            let key = id.clone();
            let moved = self
                .blocking(move |s| {
                    let moved = s.move_to_archive(&key, cutoff);
                    drop(lock);
                    moved
                })
                .await?;
            if moved {
                archived.push(id);
            }
        }
        Ok(archived)
    }

    /// Live session ids last updated at or before `cutoff`, sorted.
    fn idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, SessionError> {
        let live = self.live_dir();
        if !live.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = std::fs::read_dir(&live)
            .with_context(|| format!("Failed to list {}", live.display()))?
            .filter_map(Result::ok)
            .filter(|e| e.path().join("session.json").is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        ids.sort();

        let mut idle = Vec::new();
        for id in ids {
            if let Some(state) = read_json::<SessionState>(&self.session_path(&id))?
                && state.updated_at <= cutoff
            {
                idle.push(id);
            }
        }
        Ok(idle)
    }

    /// Move one session into the archive. Caller holds the session lock.
    ///
    /// Re-reads the session so a message appended since the scan keeps it live.
    fn move_to_archive(&self, id: &str, cutoff: DateTime<Utc>) -> Result<bool, SessionError> {
        let Some(state) = read_json::<SessionState>(&self.session_path(id))? else {
            return Ok(false);
        };
        if state.updated_at > cutoff {
            return Ok(false);
        }
        let archive = self.archive_path(id);
        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::rename(self.session_path(id), &archive)
            .with_context(|| format!("Failed to archive session {}", id))?;
        let dir = self.live_dir().join(id);
        if let Err(e) = std::fs::remove_dir(&dir) {
            tracing::debug!(session = %id, error = %e, "Left session directory in place");
        }
        tracing::info!(session = %id, messages = state.messages.len(), "Session archived");
        Ok(true)
    }
}

fn new_state(id: &str, correlation_id: Option<&str>, seed: &str, token: &str) -> SessionState {
    let now = Utc::now();
    SessionState {
        session_id: id.to_string(),
        correlation_id: correlation_id.map(str::to_string),
        created_at: now,
        updated_at: now,
        messages: vec![SessionMessage::new("user", seed)],
        lock_token: token.to_string(),
    }
}
