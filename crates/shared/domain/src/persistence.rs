use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage class of an origin's data.
///
/// `Temporary`, `Default` and `Private` together form *temporary storage*: quota-managed and
/// evictable. `Persistent` is exempt from limits and eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceKind {
    Persistent,
    Temporary,
    Default,
    Private,
}

impl PersistenceKind {
    pub const ALL: [Self; 4] = [Self::Persistent, Self::Temporary, Self::Default, Self::Private];

    /// Kinds that count against the temporary-storage limit.
    pub const BEST_EFFORT: [Self; 3] = [Self::Temporary, Self::Default, Self::Private];

    /// Directory name of the repository holding this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Temporary => "temporary",
            Self::Default => "default",
            Self::Private => "private",
        }
    }

    #[must_use]
    pub const fn is_best_effort(self) -> bool {
        !matches!(self, Self::Persistent)
    }
}

impl fmt::Display for PersistenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for PersistenceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownKind(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_persistent_is_exempt() {
        assert!(!PersistenceKind::Persistent.is_best_effort());
        assert!(PersistenceKind::BEST_EFFORT.iter().all(|kind| kind.is_best_effort()));
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Private".parse(), Ok(PersistenceKind::Private));
        assert!("cloud".parse::<PersistenceKind>().is_err());
    }
}
