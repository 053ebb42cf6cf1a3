//! Per-user default handler registration through the Windows `UserChoice`
//! hash.
//!
//! The hash pipeline (`hash`, `digest`, `filetime`) is portable. Registry
//! and shell access go through the [`store::RegistryHive`] and
//! [`platform::Platform`] traits, with Windows implementations behind
//! `cfg(windows)`.

pub mod association;
pub mod clock;
pub mod controller;
pub mod digest;
pub mod error;
pub mod filetime;
pub mod hash;
pub mod platform;
pub mod registry;
pub mod store;
pub mod sysinfo;

pub use association::{ApplicationIdentity, AssociationTarget};
pub use controller::{ControllerOptions, DefaultHandlerController, SetDefaultOutcome};
pub use error::Failure;
pub use hash::{generate_hash, UserChoiceHasher};
pub use registry::{UserChoiceRecord, UserChoiceRegistry, Verification};
