//! Persistent store: known users and their pending-message queues.
//!
//! Layout inside the data directory:
//! - users.json     : array of [`User`] records
//! - queues.json    : object mapping user name to pending texts (FIFO)
//! - chatrelay.lock : exclusive lock held for the life of the [`Store`]

pub mod lock;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Error;

pub use lock::{acquire_lock, LockHandle};

pub type Result<T> = std::result::Result<T, Error>;

pub const USERS_FILE: &str = "users.json";
pub const QUEUES_FILE: &str = "queues.json";

/// A chat user known to the hub.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct User {
    pub name: String,

    #[serde(default)]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub last_chat_id: Option<i64>,
}

impl User {
    pub fn new(name: &str, aliases: &[String]) -> Self {
        Self {
            name: name.to_string(),
            aliases: aliases.to_vec(),
            last_chat_id: None,
        }
    }
}

/// Outcome of observing a sender on the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    /// Canonical name of the resolved user.
    pub name: String,
    pub created: bool,
    pub chat_changed: bool,
}

/// Users and queues backed by a locked data directory.
#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    users: Vec<User>,
    /// Name or alias to index into `users`.
    index: HashMap<String, usize>,
    queues: BTreeMap<String, Vec<String>>,
    _lock: LockHandle,
}

impl Store {
    /// Lock `dir` exclusively and return an empty store over it.
    pub fn acquire(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let lock = acquire_lock(&dir)?;
        Ok(Self {
            dir,
            users: Vec::new(),
            index: HashMap::new(),
            queues: BTreeMap::new(),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn users_path(&self) -> PathBuf {
        self.dir.join(USERS_FILE)
    }

    fn queues_path(&self) -> PathBuf {
        self.dir.join(QUEUES_FILE)
    }

    /// Load both records from disk.
    ///
    /// Missing files mean empty state. A malformed record is reported but
    /// does not prevent the other one from loading.
    pub fn load(&mut self) -> Result<()> {
        let mut first_err = None;

        match read_json::<Vec<User>>(&self.users_path()) {
            Ok(Some(users)) => self.set_users(users),
            Ok(None) => {}
            Err(e) => first_err = Some(e),
        }

        match read_json::<BTreeMap<String, Vec<String>>>(&self.queues_path()) {
            Ok(Some(queues)) => self.queues = queues,
            Ok(None) => {}
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }

        tracing::debug!(
            "Loaded {} users and {} queues from {}",
            self.users.len(),
            self.queues.len(),
            self.dir.display()
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write both records atomically; both are attempted, the first error wins.
    pub fn save(&self) -> Result<()> {
        let users = write_json(&self.users_path(), &self.users);
        let queues = write_json(&self.queues_path(), &self.queues);
        users.and(queues)
    }

    fn set_users(&mut self, users: Vec<User>) {
        self.users.clear();
        self.index.clear();
        for user in users {
            if user.name.is_empty() {
                tracing::warn!("Dropping stored user record with empty name");
                continue;
            }
            if self.index.contains_key(&user.name) {
                tracing::warn!("Dropping duplicate stored user {}", user.name);
                continue;
            }
            self.insert_user(user);
        }
    }

    fn insert_user(&mut self, user: User) -> usize {
        let idx = self.users.len();
        self.index.insert(user.name.clone(), idx);
        for alias in &user.aliases {
            self.index.entry(alias.clone()).or_insert(idx);
        }
        self.users.push(user);
        idx
    }

    /// Look up a user by name or alias.
    pub fn user(&self, name: &str) -> Option<&User> {
        self.index.get(name).map(|&i| &self.users[i])
    }

    /// Last known chat id for a name or alias.
    pub fn chat_id(&self, name: &str) -> Option<i64> {
        self.user(name).and_then(|u| u.last_chat_id)
    }

    /// Record that `name` was seen writing from `chat_id`.
    ///
    /// Unknown senders are created with `aliases`.
    pub fn observe(&mut self, name: &str, chat_id: i64, aliases: &[String]) -> Observed {
        let existing = self.index.get(name).copied();
        let (idx, created) = match existing {
            Some(idx) => (idx, false),
            None => {
                tracing::info!("New user {} (aliases: {:?})", name, aliases);
                (self.insert_user(User::new(name, aliases)), true)
            }
        };

        let user = &mut self.users[idx];
        let chat_changed = user.last_chat_id != Some(chat_id);
        if chat_changed {
            user.last_chat_id = Some(chat_id);
        }

        Observed {
            name: user.name.clone(),
            created,
            chat_changed,
        }
    }

    /// Canonical key for queueing: the user's name if known, else `name` itself.
    pub fn queue_key(&self, name: &str) -> String {
        self.user(name)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| name.to_string())
    }

    /// Append `text` to the queue of `name`.
    pub fn enqueue(&mut self, name: &str, text: &str) {
        let key = self.queue_key(name);
        self.queues.entry(key).or_default().push(text.to_string());
    }

    /// Drain everything pending for `name`, including entries queued under
    /// its aliases before the user was known; those come first. Emptied
    /// queues stay as `[]`.
    pub fn take_queue(&mut self, name: &str) -> Vec<String> {
        let canonical = self.queue_key(name);
        let mut keys: Vec<String> = self
            .user(name)
            .map(|user| {
                user.aliases
                    .iter()
                    .filter(|alias| **alias != canonical)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        keys.push(canonical);

        let mut pending = Vec::new();
        for key in keys {
            if let Some(queue) = self.queues.get_mut(&key) {
                pending.append(queue);
            }
        }
        pending
    }

    /// Put undelivered entries back ahead of anything queued since.
    pub fn requeue_front(&mut self, name: &str, remaining: Vec<String>) {
        if remaining.is_empty() {
            return;
        }
        let key = self.queue_key(name);
        let queue = self.queues.entry(key).or_default();
        let newer = std::mem::replace(queue, remaining);
        queue.extend(newer);
    }

    /// Pending texts for `name`.
    pub fn queue(&self, name: &str) -> &[String] {
        self.queues
            .get(&self.queue_key(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn queues(&self) -> &BTreeMap<String, Vec<String>> {
        &self.queues
    }

    /// Names with pending messages and a known chat id.
    pub fn flushable_users(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, texts)| !texts.is_empty())
            .filter(|(name, _)| self.chat_id(name).is_some())
            .map(|(name, _)| self.queue_key(name))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::persistence(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| Error::persistence(path, e))
}

/// Write `value` next to `path` and rename it into place.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::persistence(path, "path has no parent directory"))?;
    let content = serde_json::to_vec_pretty(value).map_err(|e| Error::persistence(path, e))?;

    let mut temp_file = tempfile::Builder::new()
        .prefix(".chatrelay")
        .suffix(".new")
        .tempfile_in(parent)
        .map_err(|e| Error::persistence(path, e))?;
    temp_file
        .write_all(&content)
        .and_then(|_| temp_file.as_file_mut().sync_all())
        .map_err(|e| Error::persistence(path, e))?;
    temp_file
        .persist(path)
        .map_err(|e| Error::persistence(path, e.error))?;
    Ok(())
}
