use serde::Serialize;
use tracing::{debug, error, info};

use crate::association::{AssociationTarget, ApplicationIdentity};
use crate::clock::Clock;
use crate::digest::{Digest128, Md5Digest};
use crate::error::Failure;
use crate::platform::Platform;
use crate::registry::{UserChoiceRecord, UserChoiceRegistry, Verification};
use crate::store::RegistryHive;
use crate::sysinfo::MINIMUM_SUPPORTED_BUILD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub minimum_build: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            minimum_build: MINIMUM_SUPPORTED_BUILD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SetDefaultOutcome {
    AlreadyDefault,
    Written(UserChoiceRecord),
}

/// Makes this application the default handler for protocols and file
/// extensions. Holds no state of its own; every call re-reads the registry
/// and asks the shell.
pub struct DefaultHandlerController<S, C, P, D = Md5Digest> {
    registry: UserChoiceRegistry<S, C, D>,
    platform: P,
    identity: ApplicationIdentity,
    options: ControllerOptions,
}

fn step<T>(step: &'static str, target: &AssociationTarget, r: Result<T, Failure>) -> Result<T, Failure> {
    r.inspect_err(|e| error!(target = %target, step, error = %e, "set default failed"))
}

impl<S, C, P, D> DefaultHandlerController<S, C, P, D>
where
    S: RegistryHive,
    C: Clock,
    P: Platform,
    D: Digest128,
{
    pub fn new(
        registry: UserChoiceRegistry<S, C, D>,
        platform: P,
        identity: ApplicationIdentity,
    ) -> Self {
        Self {
            registry,
            platform,
            identity,
            options: ControllerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &UserChoiceRegistry<S, C, D> {
        &self.registry
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn identity(&self) -> &ApplicationIdentity {
        &self.identity
    }

    /// Any failure along the way reads as "not the default".
    pub fn is_default(&self, target: &AssociationTarget) -> bool {
        self.try_is_default(target).unwrap_or_else(|e| {
            debug!(target = %target, stage = e.stage(), error = %e, "is_default query failed");
            false
        })
    }

    pub fn try_is_default(&self, target: &AssociationTarget) -> Result<bool, Failure> {
        let prog_id = self.identity.prog_id();
        if !self.platform.prog_id_registered(prog_id)? {
            error!(prog_id, "ProgId is not found");
            return Ok(false);
        }
        let current = self.platform.current_default(target)?;
        Ok(current.as_deref() == Some(prog_id))
    }

    pub fn set_default(&self, target: &AssociationTarget) -> bool {
        self.try_set_default(target).is_ok()
    }

    /// Every step is terminal on failure. Nothing is written unless the
    /// current record verifies, the build is new enough and the legacy hash
    /// is still in effect.
    pub fn try_set_default(&self, target: &AssociationTarget) -> Result<SetDefaultOutcome, Failure> {
        if self.is_default(target) {
            debug!(target = %target, "already default handler");
            return Ok(SetDefaultOutcome::AlreadyDefault);
        }

        let prog_id = self.identity.prog_id();
        let registered = step("prog_id", target, self.platform.prog_id_registered(prog_id))?;
        if !registered {
            return step(
                "prog_id",
                target,
                Err(Failure::IdentifierNotRegistered(prog_id.to_string())),
            );
        }

        let sid = step("user_sid", target, self.platform.user_sid())?;

        let verification = step(
            "verify_stored_hash",
            target,
            self.registry.verify_stored_hash(target, &sid),
        )?;
        if let Verification::Unverified(reason) = verification {
            error!(target = %target, step = "verify_stored_hash", reason = ?reason, "UserChoice hash mismatch");
            return Err(reason.into_failure(target));
        }

        let build = step("platform_version", target, self.platform.os_build())?;
        if build < self.options.minimum_build {
            debug!(build, "UserChoice hash matched, but Windows build is too old");
            return step(
                "platform_version",
                target,
                Err(Failure::UnsupportedPlatformVersion {
                    build,
                    minimum: self.options.minimum_build,
                }),
            );
        }
        let hash_version = step("platform_version", target, self.platform.hash_version(&sid))?;
        if let Some(v) = hash_version.filter(|v| *v != 0) {
            return step(
                "platform_version",
                target,
                Err(Failure::UnsupportedHashVersion { hash_version: v }),
            );
        }

        let record = step(
            "write_user_choice",
            target,
            self.registry.write_user_choice(target, &sid, prog_id),
        )?;

        let actual = step("post_condition", target, self.platform.current_default(target))?;
        if actual.as_deref() != Some(prog_id) {
            return step(
                "post_condition",
                target,
                Err(Failure::PostConditionFailed {
                    target: target.to_string(),
                    expected: prog_id.to_string(),
                    actual,
                }),
            );
        }

        info!(target = %target, prog_id, hash = %record.hash, "default handler set");
        Ok(SetDefaultOutcome::Written(record))
    }
}
