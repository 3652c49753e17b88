use crate::engine::EngineKind;
use crate::persistence::PersistenceKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between an origin and its attribute suffix (`https://a.com^userContextId=1`).
pub const SUFFIX_SEPARATOR: char = '^';

/// An origin independent of persistence.
///
/// `suffix` is empty or starts with [`SUFFIX_SEPARATOR`] followed by `key=value` pairs joined by
/// `&`. `group` is the eTLD+1 the origin is accounted under. `origin` is already canonical.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrincipalKey {
    pub suffix: String,
    pub group: String,
    pub origin: String,
}

impl PrincipalKey {
    pub fn new(
        origin: impl Into<String>,
        group: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self { suffix: suffix.into(), group: group.into(), origin: origin.into() }
    }

    #[must_use]
    pub fn with_persistence(&self, persistence: PersistenceKind) -> OriginKey {
        OriginKey {
            persistence,
            suffix: self.suffix.clone(),
            group: self.group.clone(),
            origin: self.origin.clone(),
        }
    }

    /// The origin with its suffix attached, the form used for directory names.
    #[must_use]
    pub fn full_origin(&self) -> String {
        format!("{}{}", self.origin, self.suffix)
    }
}

impl fmt::Display for PrincipalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.origin, self.suffix)
    }
}

/// An origin under one persistence kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OriginKey {
    pub persistence: PersistenceKind,
    pub suffix: String,
    pub group: String,
    pub origin: String,
}

impl OriginKey {
    #[must_use]
    pub fn principal(&self) -> PrincipalKey {
        PrincipalKey::new(self.origin.clone(), self.group.clone(), self.suffix.clone())
    }

    #[must_use]
    pub fn client(&self, engine: EngineKind) -> ClientKey {
        ClientKey { origin: self.clone(), engine }
    }

    #[must_use]
    pub fn full_origin(&self) -> String {
        format!("{}{}", self.origin, self.suffix)
    }

    /// Parses the attribute pairs of the suffix, in order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        parse_suffix(&self.suffix)
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.persistence, self.origin, self.suffix)
    }
}

/// An origin's slice owned by a single engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientKey {
    pub origin: OriginKey,
    pub engine: EngineKind,
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.engine)
    }
}

/// Splits `^k=v&k2=v2` into pairs. Pairs without `=` are yielded with an empty value.
pub fn parse_suffix(suffix: &str) -> impl Iterator<Item = (&str, &str)> {
    suffix
        .strip_prefix(SUFFIX_SEPARATOR)
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_attributes_parse_in_order() {
        let key = PrincipalKey::new("https://a.com", "a.com", "^userContextId=2&privateBrowsingId=1")
            .with_persistence(PersistenceKind::Default);
        let attrs: Vec<_> = key.attributes().collect();
        assert_eq!(attrs, vec![("userContextId", "2"), ("privateBrowsingId", "1")]);
        assert_eq!(parse_suffix("").count(), 0);
    }

    #[test]
    fn keys_project_between_levels() {
        let principal = PrincipalKey::new("https://a.com", "a.com", "");
        let origin = principal.with_persistence(PersistenceKind::Temporary);
        let client = origin.client(EngineKind::Cache);
        assert_eq!(client.origin.principal(), principal);
        assert_eq!(client.to_string(), "temporary:https://a.com/cache");
    }
}
