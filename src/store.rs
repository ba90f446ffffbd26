use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Face-login columns of a user record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceFields {
    pub encoding: Option<Vec<f64>>,
    pub image_path: Option<PathBuf>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    pub username: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub face: FaceFields,
}

fn default_active() -> bool {
    true
}

impl UserRecord {
    pub fn new<S: Into<String>>(id: u64, username: S) -> Self {
        Self {
            id,
            username: username.into(),
            is_active: true,
            face: FaceFields::default(),
        }
    }

    pub fn user_ref(&self) -> UserRef {
        UserRef {
            id: self.id,
            username: self.username.clone(),
            is_active: self.is_active,
        }
    }
}

/// What a successful face login hands back. Inactive users can still
/// match; turning them away is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: u64,
    pub username: String,
    pub is_active: bool,
}

/// A user eligible for face login.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceCandidate {
    pub user: UserRef,
    pub encoding: Vec<f64>,
    pub image_path: Option<PathBuf>,
}

/// User persistence used by the face path. Each call is atomic on its own;
/// nothing spans calls.
pub trait UserStore: Send + Sync {
    fn get_by_id(&self, id: u64) -> Result<Option<UserRecord>>;

    /// Users with face login enabled and an embedding on file, in store order.
    fn list_face_enabled_with_encoding(&self) -> Result<Vec<FaceCandidate>>;

    /// Replaces the face fields of `id`. Returns false for an unknown user.
    fn update(&self, id: u64, face: FaceFields) -> Result<bool>;

    /// Adds or replaces a user.
    fn insert(&self, user: UserRecord) -> Result<()>;
}

fn candidates<'a>(users: impl Iterator<Item = &'a UserRecord>) -> Vec<FaceCandidate> {
    users
        .filter(|u| u.face.enabled)
        .filter_map(|u| {
            u.face.encoding.as_ref().map(|enc| FaceCandidate {
                user: u.user_ref(),
                encoding: enc.clone(),
                image_path: u.face.image_path.clone(),
            })
        })
        .collect()
}

/// Users kept in memory, ordered by id.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: RwLock<BTreeMap<u64, UserRecord>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I: IntoIterator<Item = UserRecord>>(users: I) -> Self {
        Self {
            users: RwLock::new(users.into_iter().map(|u| (u.id, u)).collect()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u64, UserRecord>> {
        self.users.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, UserRecord>> {
        self.users.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl UserStore for MemoryUserStore {
    fn get_by_id(&self, id: u64) -> Result<Option<UserRecord>> {
        Ok(self.read().get(&id).cloned())
    }

    fn list_face_enabled_with_encoding(&self) -> Result<Vec<FaceCandidate>> {
        Ok(candidates(self.read().values()))
    }

    fn update(&self, id: u64, face: FaceFields) -> Result<bool> {
        match self.write().get_mut(&id) {
            Some(user) => {
                user.face = face;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn insert(&self, user: UserRecord) -> Result<()> {
        self.write().insert(user.id, user);
        Ok(())
    }
}

/// Users persisted as a JSON array. Every write rewrites the file, and the
/// in-memory view only changes once that write succeeded.
#[derive(Debug)]
pub struct JsonUserStore {
    path: PathBuf,
    users: RwLock<BTreeMap<u64, UserRecord>>,
}

impl JsonUserStore {
    /// Opens `path`, starting empty when the file does not exist yet.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let users: Vec<UserRecord> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), users = users.len(), "opened user store");

        Ok(Self {
            path,
            users: RwLock::new(users.into_iter().map(|u| (u.id, u)).collect()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u64, UserRecord>> {
        self.users.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, UserRecord>> {
        self.users.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, users: &BTreeMap<u64, UserRecord>) -> Result<()> {
        let list: Vec<&UserRecord> = users.values().collect();
        let json = serde_json::to_vec_pretty(&list).map_err(|e| Error::Store(e.to_string()))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl UserStore for JsonUserStore {
    fn get_by_id(&self, id: u64) -> Result<Option<UserRecord>> {
        Ok(self.read().get(&id).cloned())
    }

    fn list_face_enabled_with_encoding(&self) -> Result<Vec<FaceCandidate>> {
        Ok(candidates(self.read().values()))
    }

    fn update(&self, id: u64, face: FaceFields) -> Result<bool> {
        let mut users = self.write();
        if !users.contains_key(&id) {
            return Ok(false);
        }
        let mut next = users.clone();
        if let Some(user) = next.get_mut(&id) {
            user.face = face;
        }
        self.persist(&next)?;
        *users = next;
        Ok(true)
    }

    fn insert(&self, user: UserRecord) -> Result<()> {
        let mut users = self.write();
        let mut next = users.clone();
        next.insert(user.id, user);
        self.persist(&next)?;
        *users = next;
        Ok(())
    }
}
