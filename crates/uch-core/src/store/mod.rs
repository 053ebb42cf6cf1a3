//! Access to the per-user registry root.
//!
//! Paths are relative to the hive root (HKCU on Windows) and compare
//! case-insensitively, as registry key and value names do.

mod memory;
#[cfg(windows)]
mod hkcu;

pub use memory::MemoryHive;
#[cfg(windows)]
pub use hkcu::CurrentUserHive;

use crate::error::Failure;
use crate::filetime::FileTime;

pub trait RegistryHive {
    fn key_exists(&self, path: &str) -> Result<bool, Failure>;

    /// `Ok(None)` when the key exists but the value does not (or is not a
    /// string). A missing key is `RegistryKeyMissing`.
    fn read_string(&self, path: &str, name: &str) -> Result<Option<String>, Failure>;

    /// Key metadata, not a stored value.
    fn last_write_time(&self, path: &str) -> Result<FileTime, Failure>;

    /// Deletes a key without subkeys. A missing key is `RegistryKeyMissing`.
    fn delete_key(&self, path: &str) -> Result<(), Failure>;

    /// Creates the key (and any missing parents) with read/write access.
    fn create_key(&self, path: &str) -> Result<(), Failure>;

    fn write_string(&self, path: &str, name: &str, value: &str) -> Result<(), Failure>;
}

impl<H: RegistryHive + ?Sized> RegistryHive for &H {
    fn key_exists(&self, path: &str) -> Result<bool, Failure> {
        (**self).key_exists(path)
    }

    fn read_string(&self, path: &str, name: &str) -> Result<Option<String>, Failure> {
        (**self).read_string(path, name)
    }

    fn last_write_time(&self, path: &str) -> Result<FileTime, Failure> {
        (**self).last_write_time(path)
    }

    fn delete_key(&self, path: &str) -> Result<(), Failure> {
        (**self).delete_key(path)
    }

    fn create_key(&self, path: &str) -> Result<(), Failure> {
        (**self).create_key(path)
    }

    fn write_string(&self, path: &str, name: &str, value: &str) -> Result<(), Failure> {
        (**self).write_string(path, name, value)
    }
}
