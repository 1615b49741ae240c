use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use tracing::{debug, warn};

use crate::types::Credential;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid credential file {}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable medium behind a [`CredentialStore`].
///
/// Implementations only need to persist one record; the store keeps the
/// authoritative in-memory copy and serializes calls to `save`/`remove`.
pub trait CredentialPersistence: Send + Sync {
    fn load(&self) -> Result<Option<Credential>, StoreError>;
    fn save(&self, credential: &Credential) -> Result<(), StoreError>;
    fn remove(&self) -> Result<(), StoreError>;
}

/// Keeps nothing; the session lives only as long as the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryPersistence;

impl CredentialPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<Credential>, StoreError> {
        Ok(None)
    }

    fn save(&self, _credential: &Credential) -> Result<(), StoreError> {
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// JSON file holding one credential per session name, e.g.
/// `~/.keyward/credentials.json`.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
    session: String,
}

type CredentialFile = BTreeMap<String, serde_json::Value>;

impl FilePersistence {
    pub fn new(path: PathBuf, session: impl Into<String>) -> Self {
        Self {
            path,
            session: session.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<CredentialFile, StoreError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CredentialFile::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            },
        };
        serde_json::from_str(&data).map_err(|source| StoreError::Format {
            path: self.path.clone(),
            source,
        })
    }

    /// Write via a sibling temp file and rename so readers never see a partial file.
    fn write_file(&self, map: &CredentialFile) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let data = serde_json::to_string_pretty(map).map_err(|source| StoreError::Format {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("tmp");
        // A leftover from an interrupted write may have looser permissions.
        match std::fs::remove_file(&tmp) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(io_err(e)),
            _ => {},
        }
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        // Owner-only from the moment the file exists.
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp).map_err(io_err)?;
        file.write_all(data.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl CredentialPersistence for FilePersistence {
    fn load(&self) -> Result<Option<Credential>, StoreError> {
        let mut map = self.read_file()?;
        let Some(value) = map.remove(&self.session) else {
            return Ok(None);
        };
        match serde_json::from_value::<Credential>(value) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                warn!(path = %self.path.display(), session = %self.session, error = %e, "ignoring invalid stored credential");
                Ok(None)
            },
        }
    }

    fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut map = self.read_file()?;
        let value = serde_json::to_value(credential).map_err(|source| StoreError::Format {
            path: self.path.clone(),
            source,
        })?;
        map.insert(self.session.clone(), value);
        self.write_file(&map)
    }

    fn remove(&self) -> Result<(), StoreError> {
        let mut map = self.read_file()?;
        if map.remove(&self.session).is_none() {
            return Ok(());
        }
        self.write_file(&map)
    }
}

/// Holder of the current credential for one session.
///
/// Reads never touch the persistence medium: they clone an `Arc` out of the
/// slot, so a reader sees either the old or the new credential, never a mix.
/// Writes replace the slot first, then persist the latest value.
pub struct CredentialStore {
    current: RwLock<Option<Arc<Credential>>>,
    persistence: Box<dyn CredentialPersistence>,
    persist_lock: Mutex<()>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("logged_in", &self.get().is_some())
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Logged-out store that persists nothing.
    pub fn in_memory() -> Self {
        Self::with_initial(None, Box::new(MemoryPersistence))
    }

    /// Store backed by `persistence`, seeded with whatever it holds.
    pub fn open(persistence: impl CredentialPersistence + 'static) -> Result<Self, StoreError> {
        let initial = persistence.load()?;
        debug!(
            logged_in = initial.is_some(),
            "opened credential store"
        );
        Ok(Self::with_initial(initial, Box::new(persistence)))
    }

    fn with_initial(initial: Option<Credential>, persistence: Box<dyn CredentialPersistence>) -> Self {
        Self {
            current: RwLock::new(initial.map(Arc::new)),
            persistence,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Option<Arc<Credential>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.get().is_some()
    }

    /// Replace the credential. On `Err` the new value is already visible to
    /// readers; only persisting it failed.
    pub fn set(&self, credential: Credential) -> Result<Arc<Credential>, StoreError> {
        let credential = Arc::new(credential);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&credential));
        self.persist_latest()?;
        Ok(credential)
    }

    /// Replace (or clear, when `new` is `None`) only if the store still holds
    /// `expected`. Returns whether the swap happened; an `Err` means it did
    /// but persisting failed.
    pub fn compare_and_swap(
        &self,
        expected: &Credential,
        new: Option<Arc<Credential>>,
    ) -> Result<bool, StoreError> {
        {
            let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let matches = slot.as_deref().is_some_and(|c| c.same_token(expected));
            if !matches {
                return Ok(false);
            }
            *slot = new;
        }
        self.persist_latest()?;
        Ok(true)
    }

    /// Transition to logged-out.
    pub fn clear(&self) -> Result<(), StoreError> {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.persist_latest()
    }

    /// Persist whatever is current, so racing writers converge on the latest value.
    fn persist_latest(&self) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.get() {
            Some(credential) => self.persistence.save(&credential),
            None => self.persistence.remove(),
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
