//! What the controller needs from the operating system besides the
//! per-user hive: the identifier store, the shell's effective default and a
//! few facts about the current user and build.

#[cfg(windows)]
mod win32;

#[cfg(windows)]
pub use win32::WindowsPlatform;

use crate::association::AssociationTarget;
use crate::error::Failure;

pub trait Platform {
    /// Whether `prog_id` exists in the system's identifier store (HKCR).
    fn prog_id_registered(&self, prog_id: &str) -> Result<bool, Failure>;

    /// The ProgId the shell currently resolves for `target`, after its own
    /// UserChoice verification. `None` when nothing is associated.
    fn current_default(&self, target: &AssociationTarget) -> Result<Option<String>, Failure>;

    fn user_sid(&self) -> Result<String, Failure>;

    fn os_build(&self) -> Result<u32, Failure>;

    /// `HashVersion` for `sid`; `None` or `Some(0)` means the legacy hash.
    fn hash_version(&self, sid: &str) -> Result<Option<u32>, Failure>;
}

impl<P: Platform + ?Sized> Platform for &P {
    fn prog_id_registered(&self, prog_id: &str) -> Result<bool, Failure> {
        (**self).prog_id_registered(prog_id)
    }

    fn current_default(&self, target: &AssociationTarget) -> Result<Option<String>, Failure> {
        (**self).current_default(target)
    }

    fn user_sid(&self) -> Result<String, Failure> {
        (**self).user_sid()
    }

    fn os_build(&self) -> Result<u32, Failure> {
        (**self).os_build()
    }

    fn hash_version(&self, sid: &str) -> Result<Option<u32>, Failure> {
        (**self).hash_version(sid)
    }
}
