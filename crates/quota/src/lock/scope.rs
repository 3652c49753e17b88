use crate::error::QuotaError;
use qhub_domain::keys::{SUFFIX_SEPARATOR, parse_suffix};
use qhub_domain::{ClientKey, EngineKind, OriginKey, PersistenceKind};
use qhub_kernel::security::OriginGuard;
use std::fmt;

/// Origin attributes that an origin suffix must carry, e.g. `privateBrowsingId=1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginPattern {
    attributes: Vec<(String, String)>,
}

impl OriginPattern {
    /// Builds a pattern from `key=value` pairs.
    ///
    /// # Errors
    /// Returns [`QuotaError::InvalidArgument`] for an empty pattern or an empty key.
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, QuotaError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let attributes: Vec<(String, String)> =
            pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        if attributes.is_empty() {
            return Err(QuotaError::invalid("origin pattern needs at least one attribute"));
        }
        if attributes.iter().any(|(k, _)| k.is_empty()) {
            return Err(QuotaError::invalid("origin pattern attribute key is empty"));
        }
        Ok(Self { attributes })
    }

    /// Parses `^k=v&k2=v2` or `k=v&k2=v2`.
    ///
    /// # Errors
    /// Same as [`OriginPattern::new`].
    pub fn parse(raw: &str) -> Result<Self, QuotaError> {
        let suffix = if raw.starts_with(SUFFIX_SEPARATOR) {
            raw.to_owned()
        } else {
            format!("{SUFFIX_SEPARATOR}{raw}")
        };
        Self::new(parse_suffix(&suffix))
    }

    /// Whether the suffix of `full_origin` carries every attribute of the pattern.
    #[must_use]
    pub fn matches(&self, full_origin: &str) -> bool {
        let suffix = full_origin.find(SUFFIX_SEPARATOR).map_or("", |at| &full_origin[at..]);
        let attrs: Vec<(&str, &str)> = parse_suffix(suffix).collect();
        self.attributes.iter().all(|(k, v)| attrs.iter().any(|(ak, av)| ak == k && av == v))
    }

    fn compatible(&self, other: &Self) -> bool {
        self.attributes.iter().all(|(k, v)| {
            other.attributes.iter().all(|(ok, ov)| ok != k || ov == v)
        })
    }
}

impl fmt::Display for OriginPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = SUFFIX_SEPARATOR;
        for (k, v) in &self.attributes {
            write!(f, "{sep}{k}={v}")?;
            sep = '&';
        }
        Ok(())
    }
}

/// Which origins a lock covers. Strings are full origins (origin plus suffix).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OriginScope {
    All,
    Origin(String),
    Prefix(String),
    Pattern(OriginPattern),
}

impl OriginScope {
    #[must_use]
    pub fn matches(&self, full_origin: &str) -> bool {
        match self {
            Self::All => true,
            Self::Origin(origin) => origin == full_origin,
            Self::Prefix(prefix) => full_origin.starts_with(prefix.as_str()),
            Self::Pattern(pattern) => pattern.matches(full_origin),
        }
    }

    /// Like [`OriginScope::matches`], against a sanitized directory name.
    #[must_use]
    pub fn matches_directory(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Origin(origin) => OriginGuard::sanitize(origin) == name,
            Self::Prefix(prefix) => name.starts_with(&OriginGuard::sanitize(prefix)),
            Self::Pattern(pattern) => pattern.matches(name),
        }
    }

    /// Conservative overlap test: `Prefix` against `Pattern` always overlaps.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => true,
            (Self::Origin(a), b) | (b, Self::Origin(a)) => b.matches(a),
            (Self::Prefix(a), Self::Prefix(b)) => a.starts_with(b.as_str()) || b.starts_with(a.as_str()),
            (Self::Prefix(_), Self::Pattern(_)) | (Self::Pattern(_), Self::Prefix(_)) => true,
            (Self::Pattern(a), Self::Pattern(b)) => a.compatible(b),
        }
    }
}

impl fmt::Display for OriginScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Origin(origin) => f.write_str(origin),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::Pattern(pattern) => write!(f, "*{pattern}"),
        }
    }
}

/// The region of the storage tree a directory lock covers.
///
/// `None` means every persistence kind or every engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockScope {
    pub persistence: Option<PersistenceKind>,
    pub origin: OriginScope,
    pub engine: Option<EngineKind>,
}

impl LockScope {
    #[must_use]
    pub const fn universal() -> Self {
        Self { persistence: None, origin: OriginScope::All, engine: None }
    }

    #[must_use]
    pub const fn repository(persistence: PersistenceKind) -> Self {
        Self { persistence: Some(persistence), origin: OriginScope::All, engine: None }
    }

    #[must_use]
    pub fn origin(key: &OriginKey) -> Self {
        Self {
            persistence: Some(key.persistence),
            origin: OriginScope::Origin(key.full_origin()),
            engine: None,
        }
    }

    #[must_use]
    pub fn client(key: &ClientKey) -> Self {
        Self { engine: Some(key.engine), ..Self::origin(&key.origin) }
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        let persistence = match (self.persistence, other.persistence) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let engine = match (self.engine, other.engine) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        persistence && engine && self.origin.intersects(&other.origin)
    }

    /// Whether the scope reaches into the directory of `key`.
    #[must_use]
    pub fn covers_origin(&self, persistence: PersistenceKind, full_origin: &str) -> bool {
        self.persistence.is_none_or(|p| p == persistence) && self.origin.matches(full_origin)
    }

    /// The single origin this scope is pinned to, if any.
    #[must_use]
    pub fn exact_origin(&self) -> Option<(PersistenceKind, &str)> {
        match (&self.persistence, &self.origin) {
            (Some(p), OriginScope::Origin(origin)) => Some((*p, origin.as_str())),
            _ => None,
        }
    }

    /// Persistence kinds reached by the scope.
    pub fn kinds(&self) -> impl Iterator<Item = PersistenceKind> + '_ {
        PersistenceKind::ALL.into_iter().filter(|kind| self.persistence.is_none_or(|p| p == *kind))
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.persistence {
            Some(p) => write!(f, "{p}:")?,
            None => f.write_str("*:")?,
        }
        write!(f, "{}", self.origin)?;
        match self.engine {
            Some(e) => write!(f, "/{e}"),
            None => f.write_str("/*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qhub_domain::PrincipalKey;

    fn origin(kind: PersistenceKind, origin: &str) -> OriginKey {
        PrincipalKey::new(origin, "a.com", "").with_persistence(kind)
    }

    #[test]
    fn disjoint_engines_do_not_intersect() {
        let key = origin(PersistenceKind::Default, "https://a.com");
        let idb = LockScope::client(&key.client(EngineKind::Document));
        let cache = LockScope::client(&key.client(EngineKind::Cache));
        assert!(!idb.intersects(&cache));
        assert!(idb.intersects(&LockScope::origin(&key)));
        assert!(cache.intersects(&LockScope::universal()));
    }

    #[test]
    fn persistence_kinds_partition_the_tree() {
        let a = LockScope::origin(&origin(PersistenceKind::Default, "https://a.com"));
        let b = LockScope::origin(&origin(PersistenceKind::Temporary, "https://a.com"));
        assert!(!a.intersects(&b));
        assert!(a.intersects(&LockScope { persistence: None, ..b }));
    }

    #[test]
    fn prefix_and_pattern_scopes() {
        let prefix = OriginScope::Prefix("https://a.com".to_owned());
        assert!(prefix.matches("https://a.com^userContextId=1"));
        assert!(!prefix.matches("https://b.com"));
        assert!(prefix.intersects(&OriginScope::Prefix("https://a".to_owned())));

        let private = OriginPattern::parse("privateBrowsingId=1").expect("pattern");
        assert!(private.matches("https://a.com^privateBrowsingId=1&userContextId=2"));
        assert!(!private.matches("https://a.com"));

        let public = OriginPattern::parse("^privateBrowsingId=0").expect("pattern");
        assert!(!OriginScope::Pattern(private.clone()).intersects(&OriginScope::Pattern(public)));
        let other = OriginPattern::parse("userContextId=2").expect("pattern");
        assert!(OriginScope::Pattern(private).intersects(&OriginScope::Pattern(other)));
    }

    #[test]
    fn directory_matching_follows_sanitizing() {
        let scope = OriginScope::Origin("https://a.com:8080".to_owned());
        assert!(scope.matches_directory("https+++a.com+8080"));
        let prefix = OriginScope::Prefix("https://a.com".to_owned());
        assert!(prefix.matches_directory("https+++a.com^userContextId=3"));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(OriginPattern::parse("").is_err());
        assert!(OriginPattern::new([("", "1")]).is_err());
    }
}
