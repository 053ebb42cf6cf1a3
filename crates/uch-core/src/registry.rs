use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::association::{AssociationTarget, HASH_VALUE, PROG_ID_VALUE};
use crate::clock::Clock;
use crate::digest::{Digest128, Md5Digest};
use crate::error::Failure;
use crate::filetime::{same_minute, FileTime};
use crate::hash::UserChoiceHasher;
use crate::store::RegistryHive;

/// How long the delete/create/write sequence may take. A hash computed
/// closer than this to the end of its minute is recomputed after the
/// boundary.
pub const DEFAULT_WRITE_THRESHOLD: Duration = Duration::from_millis(100);

/// UserChoice exactly as found, nothing verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserChoice {
    pub prog_id: Option<String>,
    pub hash: Option<String>,
    pub last_write_time: FileTime,
}

/// A complete UserChoice record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserChoiceRecord {
    pub prog_id: String,
    pub hash: String,
    pub last_write_time: FileTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified(UserChoiceRecord),
    Unverified(Unverified),
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified(_))
    }
}

/// Why a stored record cannot be trusted. These are ordinary outcomes, not
/// errors: the user or another program may have changed the association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unverified {
    AssociationKeyMissing,
    UserChoiceMissing,
    ValueMissing(&'static str),
    Mismatch { stored: String, computed: String },
}

impl Unverified {
    pub fn into_failure(self, target: &AssociationTarget) -> Failure {
        match self {
            Self::AssociationKeyMissing => Failure::RegistryKeyMissing {
                path: target.key_path(),
            },
            Self::UserChoiceMissing => Failure::RegistryKeyMissing {
                path: target.user_choice_path(),
            },
            Self::ValueMissing(name) => Failure::RegistryValueMissing {
                path: target.user_choice_path(),
                name: name.to_string(),
            },
            Self::Mismatch { .. } => Failure::HashMismatch,
        }
    }
}

/// Reads, verifies and writes UserChoice records in one hive. Callers need
/// exclusive use of the hive for the duration of a write.
pub struct UserChoiceRegistry<S, C, D = Md5Digest> {
    store: S,
    clock: C,
    hasher: UserChoiceHasher<D>,
    write_threshold: Duration,
}

impl<S, C, D> UserChoiceRegistry<S, C, D>
where
    S: RegistryHive,
    C: Clock,
    D: Digest128,
{
    pub fn new(store: S, clock: C, hasher: UserChoiceHasher<D>) -> Self {
        Self {
            store,
            clock,
            hasher,
            write_threshold: DEFAULT_WRITE_THRESHOLD,
        }
    }

    pub fn with_write_threshold(mut self, threshold: Duration) -> Self {
        self.write_threshold = threshold;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn hasher(&self) -> &UserChoiceHasher<D> {
        &self.hasher
    }

    pub fn read_user_choice(
        &self,
        target: &AssociationTarget,
    ) -> Result<Option<UserChoice>, Failure> {
        let path = target.user_choice_path();
        if !self.store.key_exists(&path)? {
            return Ok(None);
        }
        let last_write_time = self.store.last_write_time(&path)?;
        let prog_id = self.store.read_string(&path, PROG_ID_VALUE)?;
        let hash = self.store.read_string(&path, HASH_VALUE)?;
        Ok(Some(UserChoice {
            prog_id,
            hash,
            last_write_time,
        }))
    }

    /// Recomputes the hash of the stored record from the key's own
    /// last-write time and compares it ordinally with the stored text.
    ///
    /// `sid` is the current user's SID, not the key owner's. A key owned by
    /// someone else will not verify, which is the desired outcome.
    pub fn verify_stored_hash(
        &self,
        target: &AssociationTarget,
        sid: &str,
    ) -> Result<Verification, Failure> {
        if !self.store.key_exists(&target.key_path())? {
            return Ok(Verification::Unverified(Unverified::AssociationKeyMissing));
        }
        let Some(uc) = self.read_user_choice(target)? else {
            return Ok(Verification::Unverified(Unverified::UserChoiceMissing));
        };
        let Some(prog_id) = uc.prog_id else {
            return Ok(Verification::Unverified(Unverified::ValueMissing(PROG_ID_VALUE)));
        };
        let Some(stored) = uc.hash else {
            return Ok(Verification::Unverified(Unverified::ValueMissing(HASH_VALUE)));
        };

        let computed = self
            .hasher
            .generate_at(target.as_str(), sid, &prog_id, uc.last_write_time)?;
        if computed != stored {
            debug!(target = %target, stored = %stored, computed = %computed, "UserChoice hash mismatch");
            return Ok(Verification::Unverified(Unverified::Mismatch { stored, computed }));
        }

        Ok(Verification::Verified(UserChoiceRecord {
            prog_id,
            hash: stored,
            last_write_time: uc.last_write_time,
        }))
    }

    /// Replaces UserChoice with `prog_id` and a hash for the current minute.
    ///
    /// The shell creates UserChoice with a deny-set-value ACE, so the key is
    /// deleted and recreated rather than edited. A missing UserChoice is fine;
    /// a missing association key is not. If the key's last-write time still
    /// lands in a later minute than the hash, the record left behind will
    /// not verify and `WriteCrossedMinute` is returned.
    pub fn write_user_choice(
        &self,
        target: &AssociationTarget,
        sid: &str,
        prog_id: &str,
    ) -> Result<UserChoiceRecord, Failure> {
        let mut hash_time = self.clock.now();
        let mut hash = self
            .hasher
            .generate(target.as_str(), sid, prog_id, hash_time)?;

        // Hashing may have taken a while, so measure from now.
        let write_end = self
            .clock
            .now()
            .checked_add(self.write_threshold)
            .ok_or(Failure::TimestampConversionFailed)?;
        if !same_minute(hash_time, write_end)? {
            warn!(target = %target, "hash is too close to expiration, sleeping until next hash");
            self.clock.sleep(self.write_threshold * 2);

            hash_time = self.clock.now();
            hash = self
                .hasher
                .generate(target.as_str(), sid, prog_id, hash_time)?;
        }

        let assoc_path = target.key_path();
        if !self.store.key_exists(&assoc_path)? {
            error!(path = %assoc_path, "association key not found");
            return Err(Failure::RegistryKeyMissing { path: assoc_path });
        }

        let path = target.user_choice_path();
        match self.store.delete_key(&path) {
            Ok(()) | Err(Failure::RegistryKeyMissing { .. }) => {}
            Err(e) => {
                error!(path = %path, error = %e, "failed to delete UserChoice key");
                return Err(e);
            }
        }

        self.store.create_key(&path).inspect_err(|e| {
            error!(path = %path, error = %e, "failed to create UserChoice key");
        })?;
        self.store
            .write_string(&path, PROG_ID_VALUE, prog_id)
            .inspect_err(|e| error!(error = %e, "failed to write ProgID value"))?;
        self.store
            .write_string(&path, HASH_VALUE, &hash)
            .inspect_err(|e| error!(error = %e, "failed to write Hash value"))?;

        let last_write_time = self.store.last_write_time(&path)?;
        let hashed_minute = FileTime::from_system_time(hash_time)?.truncate_to_minute();
        if last_write_time.truncate_to_minute() != hashed_minute {
            error!(
                target = %target,
                hashed = hashed_minute.as_u64(),
                written = last_write_time.as_u64(),
                "UserChoice write crossed a minute boundary"
            );
            return Err(Failure::WriteCrossedMinute {
                hashed: hashed_minute.as_u64(),
                written: last_write_time.as_u64(),
            });
        }

        Ok(UserChoiceRecord {
            prog_id: prog_id.to_string(),
            hash,
            last_write_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryHive;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SID: &str = "S-1-5-21-463486358-3398762107-1964875780-1001";

    // 2019-03-13 09:52:00 UTC
    fn captured_time() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_552_470_720)
    }

    fn setup(start: SystemTime) -> (UserChoiceRegistry<MemoryHive, ManualClock>, ManualClock) {
        let clock = ManualClock::new(start);
        let hive = MemoryHive::new(clock.clone());
        let reg = UserChoiceRegistry::new(hive, clock.clone(), UserChoiceHasher::default());
        (reg, clock)
    }

    fn http() -> AssociationTarget {
        AssociationTarget::new("http").unwrap()
    }

    #[test]
    fn read_user_choice_missing_is_none() {
        let (reg, _) = setup(captured_time());
        assert_eq!(reg.read_user_choice(&http()).unwrap(), None);
    }

    #[test]
    fn write_produces_pinned_hash() {
        let (reg, _) = setup(captured_time() + Duration::from_secs(12));
        reg.store().create_key(&http().key_path()).unwrap();

        let record = reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();
        assert_eq!(record.hash, "2S6w31kEuDk=");
        assert_eq!(record.prog_id, "BraveHTML");

        let uc = reg.read_user_choice(&http()).unwrap().unwrap();
        assert_eq!(uc.prog_id.as_deref(), Some("BraveHTML"));
        assert_eq!(uc.hash.as_deref(), Some("2S6w31kEuDk="));
    }

    #[test]
    fn written_record_verifies() {
        let (reg, _) = setup(captured_time());
        reg.store().create_key(&http().key_path()).unwrap();
        let record = reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();

        assert_eq!(
            reg.verify_stored_hash(&http(), SID).unwrap(),
            Verification::Verified(record)
        );
    }

    #[test]
    fn write_without_prior_user_choice_succeeds() {
        let (reg, _) = setup(captured_time());
        let target = AssociationTarget::new(".pdf").unwrap();
        reg.store().create_key(&target.key_path()).unwrap();
        assert!(!reg.store().key_exists(&target.user_choice_path()).unwrap());

        reg.write_user_choice(&target, SID, "BravePDF").unwrap();
        assert!(reg.verify_stored_hash(&target, SID).unwrap().is_verified());
    }

    #[test]
    fn write_replaces_read_only_user_choice() {
        let (reg, clock) = setup(captured_time());
        let path = http().user_choice_path();
        reg.store().create_key(&path).unwrap();
        reg.store().write_string(&path, "ProgId", "MSEdgeHTM").unwrap();
        reg.store().deny_write(&path).unwrap();

        clock.advance(Duration::from_secs(300));
        reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();

        let uc = reg.read_user_choice(&http()).unwrap().unwrap();
        assert_eq!(uc.prog_id.as_deref(), Some("BraveHTML"));
        assert!(reg.verify_stored_hash(&http(), SID).unwrap().is_verified());
    }

    #[test]
    fn write_requires_association_key() {
        let (reg, _) = setup(captured_time());
        assert_eq!(
            reg.write_user_choice(&http(), SID, "BraveHTML"),
            Err(Failure::RegistryKeyMissing {
                path: http().key_path()
            })
        );
    }

    #[test]
    fn delete_errors_other_than_not_found_are_fatal() {
        let (reg, _) = setup(captured_time());
        let path = http().user_choice_path();
        reg.store().create_key(&path).unwrap();
        reg.store().write_string(&path, "ProgID", "MSEdgeHTM").unwrap();
        reg.store().deny_delete(&path).unwrap();

        assert!(matches!(
            reg.write_user_choice(&http(), SID, "BraveHTML"),
            Err(Failure::RegistryAccessDenied { .. })
        ));
        let uc = reg.read_user_choice(&http()).unwrap().unwrap();
        assert_eq!(uc.prog_id.as_deref(), Some("MSEdgeHTM"));
    }

    #[test]
    fn write_near_minute_end_waits_for_next_minute() {
        let start = captured_time() + Duration::from_millis(59_950);
        let (reg, clock) = setup(start);
        reg.store().create_key(&http().key_path()).unwrap();

        let record = reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();

        assert_eq!(clock.now(), start + DEFAULT_WRITE_THRESHOLD * 2);
        let next_minute = FileTime::from_system_time(captured_time() + Duration::from_secs(60))
            .unwrap();
        assert_eq!(record.last_write_time.truncate_to_minute(), next_minute);
        assert!(reg.verify_stored_hash(&http(), SID).unwrap().is_verified());
    }

    #[test]
    fn write_mid_minute_does_not_wait() {
        let start = captured_time() + Duration::from_secs(30);
        let (reg, clock) = setup(start);
        reg.store().create_key(&http().key_path()).unwrap();
        reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn custom_write_threshold_widens_the_window() {
        let start = captured_time() + Duration::from_secs(58);
        let (reg, clock) = setup(start);
        let reg = reg.with_write_threshold(Duration::from_secs(5));
        reg.store().create_key(&http().key_path()).unwrap();
        reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();
        assert_eq!(clock.now(), start + Duration::from_secs(10));
    }

    /// Moves forward by `step` after every reading, like a slow machine.
    #[derive(Clone)]
    struct SteppingClock {
        inner: ManualClock,
        step: Duration,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> SystemTime {
            let t = self.inner.now();
            self.inner.advance(self.step);
            t
        }

        fn sleep(&self, duration: Duration) {
            self.inner.advance(duration);
        }
    }

    #[test]
    fn write_that_lands_in_the_next_minute_is_an_error() {
        // Readings: association key 59.0s, hash 59.3s, threshold check
        // 59.6s, then UserChoice create 59.9s, ProgID 60.2s and Hash 60.5s.
        let clock = SteppingClock {
            inner: ManualClock::new(captured_time() + Duration::from_secs(59)),
            step: Duration::from_millis(300),
        };
        let hive = MemoryHive::new(clock.clone());
        hive.create_key(&http().key_path()).unwrap();
        let reg = UserChoiceRegistry::new(hive, clock, UserChoiceHasher::<Md5Digest>::default());

        let hashed = FileTime::from_system_time(captured_time()).unwrap().as_u64();
        match reg.write_user_choice(&http(), SID, "BraveHTML") {
            Err(Failure::WriteCrossedMinute { hashed: h, written }) => {
                assert_eq!(h, hashed);
                assert_eq!(
                    FileTime::from_u64(written).truncate_to_minute().as_u64(),
                    hashed + crate::filetime::TICKS_PER_MINUTE
                );
            }
            other => panic!("expected WriteCrossedMinute, got {:?}", other),
        }
        assert!(!reg.verify_stored_hash(&http(), SID).unwrap().is_verified());
    }

    #[test]
    fn verify_reports_missing_pieces() {
        let (reg, _) = setup(captured_time());
        assert_eq!(
            reg.verify_stored_hash(&http(), SID).unwrap(),
            Verification::Unverified(Unverified::AssociationKeyMissing)
        );

        reg.store().create_key(&http().key_path()).unwrap();
        assert_eq!(
            reg.verify_stored_hash(&http(), SID).unwrap(),
            Verification::Unverified(Unverified::UserChoiceMissing)
        );

        let path = http().user_choice_path();
        reg.store().create_key(&path).unwrap();
        assert_eq!(
            reg.verify_stored_hash(&http(), SID).unwrap(),
            Verification::Unverified(Unverified::ValueMissing(PROG_ID_VALUE))
        );

        reg.store().write_string(&path, PROG_ID_VALUE, "BraveHTML").unwrap();
        assert_eq!(
            reg.verify_stored_hash(&http(), SID).unwrap(),
            Verification::Unverified(Unverified::ValueMissing(HASH_VALUE))
        );
    }

    #[test]
    fn verify_rejects_truncated_hash() {
        let (reg, _) = setup(captured_time());
        reg.store().create_key(&http().key_path()).unwrap();
        let record = reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();

        let path = http().user_choice_path();
        reg.store()
            .write_string(&path, HASH_VALUE, &record.hash[..6])
            .unwrap();

        match reg.verify_stored_hash(&http(), SID).unwrap() {
            Verification::Unverified(Unverified::Mismatch { stored, computed }) => {
                assert_eq!(stored, &record.hash[..6]);
                assert_eq!(computed, record.hash);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn verify_is_case_sensitive() {
        let (reg, _) = setup(captured_time());
        reg.store().create_key(&http().key_path()).unwrap();
        let record = reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();
        let path = http().user_choice_path();
        reg.store()
            .write_string(&path, HASH_VALUE, &record.hash.to_lowercase())
            .unwrap();
        assert!(!reg.verify_stored_hash(&http(), SID).unwrap().is_verified());
    }

    #[test]
    fn verify_detects_moved_last_write_time() {
        let (reg, _) = setup(captured_time());
        reg.store().create_key(&http().key_path()).unwrap();
        reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();

        let moved = FileTime::from_system_time(captured_time() + Duration::from_secs(3600)).unwrap();
        reg.store()
            .set_last_write_time(&http().user_choice_path(), moved)
            .unwrap();
        assert!(!reg.verify_stored_hash(&http(), SID).unwrap().is_verified());
    }

    #[test]
    fn verify_uses_the_callers_sid() {
        let (reg, _) = setup(captured_time());
        reg.store().create_key(&http().key_path()).unwrap();
        reg.write_user_choice(&http(), SID, "BraveHTML").unwrap();
        assert!(!reg
            .verify_stored_hash(&http(), "S-1-5-21-1-2-3-500")
            .unwrap()
            .is_verified());
    }

    #[test]
    fn unverified_maps_to_failure() {
        let t = http();
        assert_eq!(
            Unverified::Mismatch {
                stored: "a".into(),
                computed: "b".into()
            }
            .into_failure(&t),
            Failure::HashMismatch
        );
        assert_eq!(
            Unverified::UserChoiceMissing.into_failure(&t),
            Failure::RegistryKeyMissing {
                path: t.user_choice_path()
            }
        );
    }
}
