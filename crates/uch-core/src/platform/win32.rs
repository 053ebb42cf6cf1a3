use std::io;

use tracing::{debug, warn};
use windows::core::HSTRING;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, CLSCTX_INPROC_SERVER,
    COINIT_APARTMENTTHREADED,
};
use windows::Win32::UI::Shell::{
    ApplicationAssociationRegistration, IApplicationAssociationRegistration, AL_EFFECTIVE,
    AT_FILEEXTENSION, AT_URLPROTOCOL,
};
use winreg::enums::{HKEY_CLASSES_ROOT, KEY_READ};
use winreg::RegKey;

use crate::association::AssociationTarget;
use crate::error::Failure;
use crate::sysinfo;

use super::Platform;

/// The running Windows session.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsPlatform;

/// Balances a successful `CoInitializeEx`. When the thread already runs COM
/// in another apartment mode the call fails but COM is usable, and nothing
/// must be uninitialized.
struct ComApartment {
    owned: bool,
}

impl ComApartment {
    fn enter() -> Result<Self, Failure> {
        let hr = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) };
        if hr.is_ok() {
            Ok(Self { owned: true })
        } else if hr == RPC_E_CHANGED_MODE {
            Ok(Self { owned: false })
        } else {
            Err(Failure::DefaultQueryFailed(format!(
                "CoInitializeEx failed with {:#010x}",
                hr.0
            )))
        }
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.owned {
            unsafe { CoUninitialize() };
        }
    }
}

impl Platform for WindowsPlatform {
    fn prog_id_registered(&self, prog_id: &str) -> Result<bool, Failure> {
        match RegKey::predef(HKEY_CLASSES_ROOT).open_subkey_with_flags(prog_id, KEY_READ) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Failure::RegistryApi {
                api: "RegOpenKeyExW(HKCR)",
                code: e.raw_os_error().unwrap_or(0),
            }),
        }
    }

    fn current_default(&self, target: &AssociationTarget) -> Result<Option<String>, Failure> {
        let _com = ComApartment::enter()?;

        let registration: IApplicationAssociationRegistration = unsafe {
            CoCreateInstance(&ApplicationAssociationRegistration, None, CLSCTX_INPROC_SERVER)
        }
        .map_err(|e| {
            Failure::DefaultQueryFailed(format!("CoCreateInstance failed with {}", e.code().0))
        })?;

        let kind = if target.is_extension() {
            AT_FILEEXTENSION
        } else {
            AT_URLPROTOCOL
        };
        let query = HSTRING::from(target.as_str());

        let prog_id = match unsafe { registration.QueryCurrentDefault(&query, kind, AL_EFFECTIVE) }
        {
            Ok(p) => p,
            Err(e) => {
                // No association at all is reported as an error too.
                warn!(target = %target, code = e.code().0, "QueryCurrentDefault failed");
                return Ok(None);
            }
        };

        let text = unsafe { prog_id.to_string() };
        unsafe { CoTaskMemFree(Some(prog_id.0 as *const _)) };

        let text = text.map_err(|e| Failure::DefaultQueryFailed(e.to_string()))?;
        debug!(target = %target, prog_id = %text, "current default");
        Ok(Some(text).filter(|s| !s.is_empty()))
    }

    fn user_sid(&self) -> Result<String, Failure> {
        sysinfo::current_user_sid()
    }

    fn os_build(&self) -> Result<u32, Failure> {
        sysinfo::read_os_build()
    }

    fn hash_version(&self, sid: &str) -> Result<Option<u32>, Failure> {
        sysinfo::read_hash_version(sid)
    }
}
