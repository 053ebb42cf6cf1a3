use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::Clock;
use crate::error::Failure;
use crate::filetime::FileTime;

use super::RegistryHive;

#[derive(Debug, Clone)]
struct Key {
    /// lowercased name -> (name as written, data)
    values: BTreeMap<String, (String, String)>,
    last_write: FileTime,
    deny_write: bool,
    deny_delete: bool,
}

/// In-memory hive. Last-write times come from the supplied clock, so a
/// record written here verifies exactly like one written to HKCU. Clones
/// share the same keys.
#[derive(Clone)]
pub struct MemoryHive {
    keys: Arc<Mutex<BTreeMap<String, Key>>>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl std::fmt::Debug for MemoryHive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHive")
            .field("keys", &self.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('\\').to_lowercase()
}

fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('\\')
        .map(move |(i, _)| &path[..i])
        .chain(std::iter::once(path))
}

impl MemoryHive {
    pub fn new<C: Clock + Send + Sync + 'static>(clock: C) -> Self {
        Self {
            keys: Arc::new(Mutex::new(BTreeMap::new())),
            clock: Arc::new(clock),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Key>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stamp(&self) -> Result<FileTime, Failure> {
        FileTime::from_system_time(self.clock.now())
    }

    /// Mimics the ACL the shell puts on UserChoice: values cannot be set,
    /// but the key can still be deleted.
    pub fn deny_write(&self, path: &str) -> Result<(), Failure> {
        self.with_key(path, |k| k.deny_write = true)
    }

    pub fn deny_delete(&self, path: &str) -> Result<(), Failure> {
        self.with_key(path, |k| k.deny_delete = true)
    }

    /// Rewrites key metadata without touching values.
    pub fn set_last_write_time(&self, path: &str, time: FileTime) -> Result<(), Failure> {
        self.with_key(path, |k| k.last_write = time)
    }

    fn with_key(&self, path: &str, f: impl FnOnce(&mut Key)) -> Result<(), Failure> {
        let mut keys = self.lock();
        let key = keys
            .get_mut(&normalize(path))
            .ok_or_else(|| Failure::RegistryKeyMissing {
                path: path.to_string(),
            })?;
        f(key);
        Ok(())
    }
}

impl RegistryHive for MemoryHive {
    fn key_exists(&self, path: &str) -> Result<bool, Failure> {
        Ok(self.lock().contains_key(&normalize(path)))
    }

    fn read_string(&self, path: &str, name: &str) -> Result<Option<String>, Failure> {
        let keys = self.lock();
        let key = keys
            .get(&normalize(path))
            .ok_or_else(|| Failure::RegistryKeyMissing {
                path: path.to_string(),
            })?;
        Ok(key
            .values
            .get(&name.to_lowercase())
            .map(|(_, data)| data.clone()))
    }

    fn last_write_time(&self, path: &str) -> Result<FileTime, Failure> {
        self.lock()
            .get(&normalize(path))
            .map(|k| k.last_write)
            .ok_or_else(|| Failure::RegistryKeyMissing {
                path: path.to_string(),
            })
    }

    fn delete_key(&self, path: &str) -> Result<(), Failure> {
        let norm = normalize(path);
        let mut keys = self.lock();
        let key = keys.get(&norm).ok_or_else(|| Failure::RegistryKeyMissing {
            path: path.to_string(),
        })?;

        let child_prefix = format!("{}\\", norm);
        let has_children = keys.keys().any(|k| k.starts_with(&child_prefix));
        if key.deny_delete || has_children {
            return Err(Failure::RegistryAccessDenied {
                path: path.to_string(),
            });
        }
        keys.remove(&norm);
        Ok(())
    }

    fn create_key(&self, path: &str) -> Result<(), Failure> {
        let norm = normalize(path);
        if norm.is_empty() {
            return Err(Failure::RegistryApi {
                api: "RegCreateKeyExW",
                code: 87,
            });
        }
        let now = self.stamp()?;
        let mut keys = self.lock();
        for prefix in ancestors(&norm) {
            keys.entry(prefix.to_string()).or_insert_with(|| Key {
                values: BTreeMap::new(),
                last_write: now,
                deny_write: false,
                deny_delete: false,
            });
        }
        Ok(())
    }

    fn write_string(&self, path: &str, name: &str, value: &str) -> Result<(), Failure> {
        let now = self.stamp()?;
        let mut keys = self.lock();
        let key = keys
            .get_mut(&normalize(path))
            .ok_or_else(|| Failure::RegistryKeyMissing {
                path: path.to_string(),
            })?;
        if key.deny_write {
            return Err(Failure::RegistryAccessDenied {
                path: path.to_string(),
            });
        }
        key.values.insert(
            name.to_lowercase(),
            (name.to_string(), value.to_string()),
        );
        key.last_write = now;
        Ok(())
    }
}
