use std::fmt;

use crate::error::Failure;

pub const FILE_EXTS_ROOT: &str = r"Software\Microsoft\Windows\CurrentVersion\Explorer\FileExts";
pub const URL_ASSOCIATIONS_ROOT: &str =
    r"Software\Microsoft\Windows\Shell\Associations\UrlAssociations";

pub const USER_CHOICE_KEY: &str = "UserChoice";
pub const PROG_ID_VALUE: &str = "ProgID";
pub const HASH_VALUE: &str = "Hash";

/// ProgIds cannot be longer than 39 characters.
/// Ref: http://msdn.microsoft.com/en-us/library/aa911706.aspx
pub const MAX_PROG_ID_LEN: usize = 39;

/// A URL protocol (`http`) or a file extension (`.pdf`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationTarget {
    name: String,
}

impl AssociationTarget {
    pub fn new(name: &str) -> Result<Self, Failure> {
        let name = name.trim();
        if name.is_empty() || name == "." || name.contains(['\\', '/', '\0']) {
            return Err(Failure::InvalidTarget(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn is_extension(&self) -> bool {
        self.name.starts_with('.')
    }

    /// The per-user association key, relative to HKCU.
    pub fn key_path(&self) -> String {
        let root = if self.is_extension() {
            FILE_EXTS_ROOT
        } else {
            URL_ASSOCIATIONS_ROOT
        };
        format!("{}\\{}", root, self.name)
    }

    pub fn user_choice_path(&self) -> String {
        format!("{}\\{}", self.key_path(), USER_CHOICE_KEY)
    }
}

impl fmt::Display for AssociationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The ProgId this application registers its handlers under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApplicationIdentity {
    prog_id: String,
}

impl ApplicationIdentity {
    /// Wraps an existing ProgId as-is. Registrations made before the length
    /// rule existed must keep working, so no truncation happens here.
    pub fn new(prog_id: &str) -> Result<Self, Failure> {
        let prog_id = prog_id.trim();
        if prog_id.is_empty() || prog_id.contains(['\\', '\0']) {
            return Err(Failure::InvalidIdentifier(prog_id.to_string()));
        }
        Ok(Self {
            prog_id: prog_id.to_string(),
        })
    }

    /// `prefix ++ install_suffix`. When the install uses the user-specific
    /// suffix scheme the ProgId is a new registration and must obey
    /// [`MAX_PROG_ID_LEN`]; legacy suffixes are preserved untouched.
    pub fn for_installation(
        prefix: &str,
        install_suffix: &str,
        user_specific_suffix: Option<&str>,
    ) -> Result<Self, Failure> {
        let mut prog_id = format!("{}{}", prefix.trim(), install_suffix.trim());
        let new_style = user_specific_suffix.map(str::trim) == Some(install_suffix.trim());
        if new_style && prog_id.chars().count() > MAX_PROG_ID_LEN {
            debug_assert!(
                false,
                "new-style ProgId {:?} exceeds {} characters",
                prog_id, MAX_PROG_ID_LEN
            );
            tracing::error!(prog_id = %prog_id, "ProgId exceeds the 39 character limit, truncating");
            prog_id = truncate_prog_id(&prog_id);
        }
        Self::new(&prog_id)
    }

    pub fn prog_id(&self) -> &str {
        &self.prog_id
    }
}

impl fmt::Display for ApplicationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prog_id)
    }
}

pub fn truncate_prog_id(prog_id: &str) -> String {
    prog_id.chars().take(MAX_PROG_ID_LEN).collect()
}
