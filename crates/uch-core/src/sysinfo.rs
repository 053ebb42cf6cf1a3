use serde::Serialize;

use crate::error::Failure;

/// Windows 10 1703 ("RS2"). UserChoice writes made this way are not honored
/// on older builds.
pub const MINIMUM_SUPPORTED_BUILD: u32 = 15063;

pub const CURRENT_VERSION_KEY: &str = r"SOFTWARE\Microsoft\Windows NT\CurrentVersion";

pub fn app_defaults_key(sid: &str) -> String {
    format!(
        r"SOFTWARE\Microsoft\Windows\CurrentVersion\SystemProtectedUserData\{}\AnyoneRead\AppDefaults",
        sid
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sysinfo {
    pub sid: String,
    pub os_build: u32,
    pub minimum_build: u32,
    pub hash_version: Option<u32>,
    pub user_choice_latest_enabled: bool,
    pub ucpd_enabled: Option<bool>,
    pub ucpd_driver_present: Option<bool>,
    pub guidance: Vec<String>,
}

impl Sysinfo {
    pub fn new(
        sid: String,
        os_build: u32,
        minimum_build: u32,
        hash_version: Option<u32>,
        ucpd_enabled: Option<bool>,
        ucpd_driver_present: Option<bool>,
    ) -> Self {
        let user_choice_latest_enabled = hash_version.unwrap_or(0) != 0;

        let mut guidance = Vec::new();
        if os_build < minimum_build {
            guidance.push(format!(
                "Build {} predates {}: set-default will refuse to write.",
                os_build, minimum_build
            ));
        }
        if user_choice_latest_enabled {
            guidance.push(
                "HashVersion!=0 detected (UserChoiceLatest enabled): the legacy hash is ignored, set-default will refuse to write."
                    .to_string(),
            );
        }
        if ucpd_enabled == Some(true) {
            guidance.push(
                "UCPD is enabled: writes to the http/https UserChoice keys will be blocked for non-system processes."
                    .to_string(),
            );
        }

        Self {
            sid,
            os_build,
            minimum_build,
            hash_version,
            user_choice_latest_enabled,
            ucpd_enabled,
            ucpd_driver_present,
            guidance,
        }
    }

    /// True when nothing in the report would stop `set-default`.
    pub fn writable(&self) -> bool {
        self.os_build >= self.minimum_build && !self.user_choice_latest_enabled
    }
}

pub fn parse_build_number(text: &str) -> Option<u32> {
    text.trim().parse().ok()
}

pub fn read_sysinfo(minimum_build: u32) -> Result<Sysinfo, Failure> {
    #[cfg(not(windows))]
    {
        let _ = minimum_build;
        return Err(Failure::WindowsOnly);
    }

    #[cfg(windows)]
    {
        let sid = current_user_sid()?;
        let os_build = read_os_build()?;
        let hash_version = read_hash_version(&sid)?;
        let (ucpd_enabled, ucpd_driver_present) = detect_ucpd();
        Ok(Sysinfo::new(
            sid,
            os_build,
            minimum_build,
            hash_version,
            ucpd_enabled,
            ucpd_driver_present,
        ))
    }
}

#[cfg(windows)]
pub fn current_user_sid() -> Result<String, Failure> {
    use windows::Win32::Foundation::{CloseHandle, LocalFree, HANDLE, HLOCAL};
    use windows::Win32::Security::Authorization::ConvertSidToStringSidW;
    use windows::Win32::Security::{GetTokenInformation, TokenUser, TOKEN_QUERY, TOKEN_USER};
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
    use windows::core::PWSTR;

    struct Token(HANDLE);

    impl Drop for Token {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    let fail = |api: &str, e: windows::core::Error| {
        Failure::SidUnavailable(format!("{} failed with {}", api, e.code().0))
    };

    unsafe {
        let mut handle = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut handle)
            .map_err(|e| fail("OpenProcessToken", e))?;
        let token = Token(handle);

        // First call only reports the size and always "fails".
        let mut needed: u32 = 0;
        let _ = GetTokenInformation(token.0, TokenUser, None, 0, &mut needed);
        if needed == 0 {
            return Err(Failure::SidUnavailable(
                "GetTokenInformation(size) returned 0".to_string(),
            ));
        }

        let mut buf = vec![0u8; needed as usize];
        GetTokenInformation(
            token.0,
            TokenUser,
            Some(buf.as_mut_ptr().cast()),
            needed,
            &mut needed,
        )
        .map_err(|e| fail("GetTokenInformation(data)", e))?;

        let token_user = &*(buf.as_ptr() as *const TOKEN_USER);
        let mut sid_w = PWSTR::null();
        ConvertSidToStringSidW(token_user.User.Sid, &mut sid_w)
            .map_err(|e| fail("ConvertSidToStringSidW", e))?;
        let sid = sid_w.to_string();
        let _ = LocalFree(HLOCAL(sid_w.0.cast()));

        sid.map_err(|e| Failure::SidUnavailable(e.to_string()))
    }
}

#[cfg(windows)]
fn hklm_api_error(api: &'static str, e: std::io::Error) -> Failure {
    Failure::RegistryApi {
        api,
        code: e.raw_os_error().unwrap_or(0),
    }
}

/// `None` when the AppDefaults key or the value is absent, which means the
/// legacy hash is in effect.
#[cfg(windows)]
pub fn read_hash_version(sid: &str) -> Result<Option<u32>, Failure> {
    use std::io::ErrorKind;
    use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ};
    use winreg::RegKey;

    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let key = match hklm.open_subkey_with_flags(app_defaults_key(sid), KEY_READ) {
        Ok(k) => k,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(hklm_api_error("RegOpenKeyExW(HKLM HashVersion)", e)),
    };
    match key.get_value::<u32, _>("HashVersion") {
        Ok(v) => Ok(Some(v)),
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::InvalidData) => Ok(None),
        Err(e) => Err(hklm_api_error("RegQueryValueExW(HashVersion)", e)),
    }
}

#[cfg(windows)]
pub fn read_os_build() -> Result<u32, Failure> {
    use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ};
    use winreg::RegKey;

    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let key = hklm
        .open_subkey_with_flags(CURRENT_VERSION_KEY, KEY_READ)
        .map_err(|e| hklm_api_error("RegOpenKeyExW(CurrentVersion)", e))?;
    let text: String = key
        .get_value("CurrentBuildNumber")
        .map_err(|e| hklm_api_error("RegQueryValueExW(CurrentBuildNumber)", e))?;
    // An unparsable build is treated as too old.
    Ok(parse_build_number(&text).unwrap_or(0))
}

#[cfg(windows)]
fn detect_ucpd() -> (Option<bool>, Option<bool>) {
    use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ};
    use winreg::RegKey;

    let driver_present = {
        let system_root = std::env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
        let path = std::path::PathBuf::from(system_root)
            .join("System32")
            .join("drivers")
            .join("UCPD.sys");
        Some(path.exists())
    };

    // Start=4 means disabled for services/drivers.
    let enabled = RegKey::predef(HKEY_LOCAL_MACHINE)
        .open_subkey_with_flags(r"SYSTEM\CurrentControlSet\Services\UCPD", KEY_READ)
        .and_then(|k| k.get_value::<u32, _>("Start"))
        .ok()
        .map(|start| start != 4);

    (enabled, driver_present)
}
