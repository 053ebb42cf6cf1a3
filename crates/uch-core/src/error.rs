/// Every way a UserChoice operation can fail.
///
/// None of these are fatal to the process. The controller collapses them to
/// `false` after logging the stage that produced them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    #[error("128-bit digest provider unavailable: {0}")]
    DigestUnavailable(String),

    #[error("hash input is shorter than one 64-bit block")]
    InputTooShort,

    #[error("timestamp cannot be represented as a FILETIME")]
    TimestampConversionFailed,

    #[error("base64 encoding failed")]
    EncodingFailed,

    #[error("invalid protocol or extension {0:?}")]
    InvalidTarget(String),

    #[error("invalid ProgId {0:?}")]
    InvalidIdentifier(String),

    #[error("access denied to registry key {path}")]
    RegistryAccessDenied { path: String },

    #[error("registry key {path} not found")]
    RegistryKeyMissing { path: String },

    #[error("registry value {name} not found under {path}")]
    RegistryValueMissing { path: String, name: String },

    #[error("{api} failed with {code}")]
    RegistryApi { api: &'static str, code: i32 },

    #[error("stored UserChoice hash does not verify")]
    HashMismatch,

    #[error("UserChoice write crossed a minute boundary (hashed {hashed:#018x}, written {written:#018x})")]
    WriteCrossedMinute { hashed: u64, written: u64 },

    #[error("Windows build {build} predates the minimum supported build {minimum}")]
    UnsupportedPlatformVersion { build: u32, minimum: u32 },

    #[error("UserChoiceLatest is enabled (HashVersion={hash_version}); the legacy hash is no longer honored")]
    UnsupportedHashVersion { hash_version: u32 },

    #[error("ProgId {0} is not registered")]
    IdentifierNotRegistered(String),

    #[error("current user SID unavailable: {0}")]
    SidUnavailable(String),

    #[error("windows-only")]
    WindowsOnly,

    #[error("default handler query failed: {0}")]
    DefaultQueryFailed(String),

    #[error("default handler for {target} is {actual:?} after the write, expected {expected}")]
    PostConditionFailed {
        target: String,
        expected: String,
        actual: Option<String>,
    },
}

impl Failure {
    /// Short pipeline stage name used in log entries.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::DigestUnavailable(_) => "digest",
            Self::InputTooShort => "scramble",
            Self::TimestampConversionFailed => "format",
            Self::EncodingFailed => "base64",
            Self::InvalidTarget(_) | Self::InvalidIdentifier(_) => "arguments",
            Self::RegistryAccessDenied { .. }
            | Self::RegistryKeyMissing { .. }
            | Self::RegistryValueMissing { .. }
            | Self::RegistryApi { .. } => "registry",
            Self::HashMismatch => "verify_stored_hash",
            Self::WriteCrossedMinute { .. } => "write_user_choice",
            Self::UnsupportedPlatformVersion { .. } | Self::UnsupportedHashVersion { .. } => {
                "platform_version"
            }
            Self::IdentifierNotRegistered(_) => "prog_id",
            Self::SidUnavailable(_) => "user_sid",
            Self::DefaultQueryFailed(_) => "query_default",
            Self::WindowsOnly => "platform",
            Self::PostConditionFailed { .. } => "post_condition",
        }
    }
}
