//! Where things live below the storage root.
//!
//! `<persistence>/<sanitized full origin>/<engine>/`, with the origin metadata next to the
//! engine directories.

use qhub_domain::{ClientKey, OriginKey, PersistenceKind};
use qhub_kernel::security::OriginGuard;
use std::path::PathBuf;

/// File holding the postcard-encoded [`crate::OriginMetadata`] of an origin directory.
pub const METADATA_FILE: &str = ".metadata";

/// File holding the usage cache, directly below the root.
pub const USAGE_CACHE_FILE: &str = "usage.cache";

#[must_use]
pub fn repository_dir(persistence: PersistenceKind) -> PathBuf {
    PathBuf::from(persistence.as_str())
}

#[must_use]
pub fn origin_dir(key: &OriginKey) -> PathBuf {
    repository_dir(key.persistence).join(OriginGuard::sanitize(&key.full_origin()))
}

#[must_use]
pub fn client_dir(key: &ClientKey) -> PathBuf {
    origin_dir(&key.origin).join(key.engine.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qhub_domain::{EngineKind, PrincipalKey};

    #[test]
    fn client_directories_nest_under_origins() {
        let key = PrincipalKey::new("https://a.com", "a.com", "^userContextId=1")
            .with_persistence(PersistenceKind::Default);
        assert_eq!(
            client_dir(&key.client(EngineKind::KeyValue)),
            PathBuf::from("default/https+++a.com^userContextId=1/kv")
        );
    }
}
