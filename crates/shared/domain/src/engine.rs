use crate::persistence::UnknownKind;
use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A storage engine sharing the per-origin directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Document,
    #[serde(rename = "kv")]
    KeyValue,
    Cache,
    Blob,
}

impl EngineKind {
    pub const COUNT: usize = 4;
    pub const ALL: [Self; Self::COUNT] = [Self::Document, Self::KeyValue, Self::Cache, Self::Blob];

    /// Name of the engine's subdirectory inside an origin directory.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::KeyValue => "kv",
            Self::Cache => "cache",
            Self::Blob => "blob",
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownKind(s.to_owned()))
    }
}

bitflags! {
    /// A subset of [`EngineKind`]s.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct EngineSet: u8 {
        const DOCUMENT = 1 << 0;
        const KEY_VALUE = 1 << 1;
        const CACHE = 1 << 2;
        const BLOB = 1 << 3;

        const ALL = Self::DOCUMENT.bits() | Self::KEY_VALUE.bits() | Self::CACHE.bits() | Self::BLOB.bits();
    }
}

impl EngineSet {
    /// Iterates the members in declaration order.
    pub fn kinds(self) -> impl Iterator<Item = EngineKind> {
        EngineKind::ALL.into_iter().filter(move |kind| self.contains(Self::from(*kind)))
    }
}

impl From<EngineKind> for EngineSet {
    fn from(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Document => Self::DOCUMENT,
            EngineKind::KeyValue => Self::KEY_VALUE,
            EngineKind::Cache => Self::CACHE,
            EngineKind::Blob => Self::BLOB,
        }
    }
}

impl From<&str> for EngineSet {
    fn from(s: &str) -> Self {
        match s {
            "all" | "*" => Self::ALL,
            other => other.parse::<EngineKind>().map_or_else(|_| Self::empty(), Self::from),
        }
    }
}

impl FromIterator<EngineKind> for EngineSet {
    fn from_iter<I: IntoIterator<Item = EngineKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |set, kind| set | Self::from(kind))
    }
}

impl Serialize for EngineSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(self.kinds().map(EngineKind::as_str))
    }
}

/// Accepts either raw bits or a list of engine names (`["document", "kv"]`, `["all"]`).
impl<'de> Deserialize<'de> for EngineSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bits(u8),
            Names(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bits(bits) => Ok(Self::from_bits_truncate(bits)),
            Repr::Names(names) => names.iter().try_fold(Self::empty(), |set, name| {
                let next = Self::from(name.as_str());
                if next.is_empty() {
                    Err(serde::de::Error::custom(format!("unknown engine '{name}'")))
                } else {
                    Ok(set | next)
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_iterates_in_declaration_order() {
        let set = EngineSet::BLOB | EngineSet::DOCUMENT;
        assert_eq!(set.kinds().collect::<Vec<_>>(), vec![EngineKind::Document, EngineKind::Blob]);
    }

    #[test]
    fn names_round_trip_through_strings() {
        for kind in EngineKind::ALL {
            assert_eq!(kind.as_str().parse(), Ok(kind));
        }
        assert_eq!(EngineSet::from("*"), EngineSet::ALL);
        assert!(EngineSet::from("sqlite").is_empty());
    }
}
