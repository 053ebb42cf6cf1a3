use std::io;

use winreg::enums::{HKEY_CURRENT_USER, KEY_READ, KEY_WRITE};
use winreg::RegKey;

use crate::error::Failure;
use crate::filetime::FileTime;

use super::RegistryHive;

/// HKEY_CURRENT_USER through `winreg`. Every call opens the key it needs
/// and closes it again; nothing is cached between calls.
pub struct CurrentUserHive {
    root: RegKey,
}

impl CurrentUserHive {
    pub fn open() -> Self {
        Self {
            root: RegKey::predef(HKEY_CURRENT_USER),
        }
    }

    fn open_key(&self, path: &str, access: u32, api: &'static str) -> Result<RegKey, Failure> {
        self.root
            .open_subkey_with_flags(path, access)
            .map_err(|e| map_io(path, api, e))
    }
}

impl Default for CurrentUserHive {
    fn default() -> Self {
        Self::open()
    }
}

fn map_io(path: &str, api: &'static str, e: io::Error) -> Failure {
    match e.kind() {
        io::ErrorKind::NotFound => Failure::RegistryKeyMissing {
            path: path.to_string(),
        },
        io::ErrorKind::PermissionDenied => Failure::RegistryAccessDenied {
            path: path.to_string(),
        },
        _ => Failure::RegistryApi {
            api,
            code: e.raw_os_error().unwrap_or(0),
        },
    }
}

impl RegistryHive for CurrentUserHive {
    fn key_exists(&self, path: &str) -> Result<bool, Failure> {
        match self.open_key(path, KEY_READ, "RegOpenKeyExW") {
            Ok(_) => Ok(true),
            Err(Failure::RegistryKeyMissing { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_string(&self, path: &str, name: &str) -> Result<Option<String>, Failure> {
        let key = self.open_key(path, KEY_READ, "RegOpenKeyExW")?;
        match key.get_value::<String, _>(name) {
            Ok(v) => Ok(Some(v)),
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::InvalidData) => {
                Ok(None)
            }
            Err(e) => Err(map_io(path, "RegQueryValueExW", e)),
        }
    }

    fn last_write_time(&self, path: &str) -> Result<FileTime, Failure> {
        let key = self.open_key(path, KEY_READ, "RegOpenKeyExW")?;
        let info = key
            .query_info()
            .map_err(|e| map_io(path, "RegQueryInfoKeyW", e))?;
        Ok(FileTime {
            low_date_time: info.last_write_time.dwLowDateTime,
            high_date_time: info.last_write_time.dwHighDateTime,
        })
    }

    fn delete_key(&self, path: &str) -> Result<(), Failure> {
        self.root
            .delete_subkey(path)
            .map_err(|e| map_io(path, "RegDeleteKeyW", e))
    }

    fn create_key(&self, path: &str) -> Result<(), Failure> {
        self.root
            .create_subkey_with_flags(path, KEY_READ | KEY_WRITE)
            .map(|_| ())
            .map_err(|e| map_io(path, "RegCreateKeyExW", e))
    }

    fn write_string(&self, path: &str, name: &str, value: &str) -> Result<(), Failure> {
        let key = self.open_key(path, KEY_READ | KEY_WRITE, "RegOpenKeyExW")?;
        key.set_value(name, &value.to_string())
            .map_err(|e| map_io(path, "RegSetValueExW", e))
    }
}
