use qhub_domain::keys::{SUFFIX_SEPARATOR, parse_suffix};
use qhub_domain::PrincipalKey;
use std::borrow::Cow;

#[qhub_derive::qhub_error]
pub enum OriginError {
    #[error("Invalid origin{}: {message}", format_context(.context))]
    Invalid { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

/// Characters replaced by `+` when an origin becomes a directory name.
const UNSAFE_CHARS: &[char] = &[':', '/', '\\', '*', '?', '"', '<', '>', '|'];

/// Validation and canonicalization of raw origin strings.
///
/// Accepted forms are `scheme://host[:port]` (a single trailing `/` is tolerated) and bare
/// internal origins such as `chrome`. An optional `^key=value&...` attribute suffix follows.
/// Scheme and host are lowercased; default ports of `http`/`https` are dropped.
#[derive(Debug)]
pub struct OriginGuard;

impl OriginGuard {
    /// Parses `raw` into a [`PrincipalKey`] with its group derived.
    ///
    /// # Errors
    /// Returns [`OriginError::Invalid`] for empty input, control characters or whitespace,
    /// paths/queries after the host, malformed ports, or malformed suffix attributes.
    pub fn parse(raw: &str) -> Result<PrincipalKey, OriginError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(invalid("origin is empty", raw));
        }
        if raw.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(invalid("origin contains whitespace or control characters", raw));
        }

        let (origin, suffix) = match raw.find(SUFFIX_SEPARATOR) {
            Some(at) => raw.split_at(at),
            None => (raw, ""),
        };
        Self::validate_suffix(suffix)?;

        let origin = Self::canonicalize(origin)?;
        let group = Self::group_of(&origin);
        Ok(PrincipalKey::new(origin, group, suffix))
    }

    /// Whether `origin` is served by something other than `http`/`https`.
    #[must_use]
    pub fn is_internal(origin: &str) -> bool {
        !(origin.starts_with("http://") || origin.starts_with("https://"))
    }

    /// Maps a full origin (origin plus suffix) onto a portable directory name.
    #[must_use]
    pub fn sanitize(full_origin: &str) -> String {
        full_origin.chars().map(|c| if UNSAFE_CHARS.contains(&c) { '+' } else { c }).collect()
    }

    /// The accounting group: the last two host labels for web origins, the host itself for IP
    /// addresses and single-label hosts, and the whole origin otherwise.
    #[must_use]
    pub fn group_of(origin: &str) -> String {
        let Some((_, rest)) = origin.split_once("://") else {
            return origin.to_owned();
        };
        let host = host_of(rest);
        if host.is_empty() {
            return origin.to_owned();
        }
        if host.starts_with('[') || host.parse::<std::net::Ipv4Addr>().is_ok() {
            return host.to_owned();
        }
        let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
        match labels.as_slice() {
            [.., second, last] => format!("{second}.{last}"),
            _ => host.to_owned(),
        }
    }

    fn canonicalize(origin: &str) -> Result<String, OriginError> {
        let Some((scheme, rest)) = origin.split_once("://") else {
            if origin.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return Ok(origin.to_ascii_lowercase());
            }
            return Err(invalid("internal origin must be alphanumeric", origin));
        };

        let scheme = scheme.to_ascii_lowercase();
        if scheme.is_empty()
            || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("malformed scheme", origin));
        }

        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.contains(['/', '?', '#', '@']) {
            return Err(invalid("origin must not carry a path, query or credentials", origin));
        }

        let host = host_of(authority).to_ascii_lowercase();
        if host.is_empty() && scheme != "file" {
            return Err(invalid("origin has no host", origin));
        }

        let port = match authority.strip_prefix(host_of(authority)).and_then(|p| p.strip_prefix(':')) {
            Some(port) => {
                let port: u16 =
                    port.parse().map_err(|_| invalid("port must be a number below 65536", origin))?;
                let default = matches!((scheme.as_str(), port), ("http", 80) | ("https", 443));
                (!default).then_some(port)
            },
            None if authority.len() > host.len() => {
                return Err(invalid("unexpected characters after host", origin));
            },
            None => None,
        };

        Ok(match port {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        })
    }

    fn validate_suffix(suffix: &str) -> Result<(), OriginError> {
        if suffix.is_empty() {
            return Ok(());
        }
        for (key, value) in parse_suffix(suffix) {
            let key_ok = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric());
            let value_ok = value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
            if !key_ok || !value_ok {
                return Err(invalid("malformed origin attribute", suffix));
            }
        }
        Ok(())
    }
}

/// Host part of an authority, bracketed IPv6 literals included.
fn host_of(authority: &str) -> &str {
    if authority.starts_with('[') {
        return authority.find(']').map_or(authority, |end| &authority[..=end]);
    }
    authority.split(':').next().unwrap_or(authority)
}

fn invalid(message: &'static str, input: &str) -> OriginError {
    OriginError::Invalid { message: message.into(), context: Some(input.to_owned().into()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn web_origins_are_canonicalized() {
        let key = OriginGuard::parse("HTTPS://WWW.Example.co:443/").expect("valid");
        assert_eq!(key.origin, "https://www.example.co");
        assert_eq!(key.group, "example.co");
        assert!(key.suffix.is_empty());

        let key = OriginGuard::parse("http://localhost:8080").expect("valid");
        assert_eq!(key.origin, "http://localhost:8080");
        assert_eq!(key.group, "localhost");
    }

    #[test]
    fn ip_hosts_group_by_themselves() {
        assert_eq!(OriginGuard::parse("http://10.0.0.1:3000").expect("ip").group, "10.0.0.1");
        assert_eq!(OriginGuard::parse("http://[::1]").expect("ipv6").group, "[::1]");
    }

    #[test]
    fn internal_origins_are_their_own_group() {
        let key = OriginGuard::parse("chrome").expect("internal");
        assert_eq!(key.group, "chrome");
        assert!(OriginGuard::is_internal(&key.origin));
        assert!(!OriginGuard::is_internal("https://a.com"));
    }

    #[test]
    fn rejects_paths_and_bad_suffixes() {
        assert!(OriginGuard::parse("https://a.com/path").is_err());
        assert!(OriginGuard::parse("https://a.com:99999").is_err());
        assert!(OriginGuard::parse("https://a.com^=1").is_err());
        assert!(OriginGuard::parse("https://a .com").is_err());
        assert!(OriginGuard::parse("").is_err());
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(OriginGuard::sanitize("http://a.com:8080"), "http+++a.com+8080");
    }

    proptest! {
        #[test]
        fn sanitized_names_never_contain_path_separators(raw in "\\PC{0,40}") {
            let name = OriginGuard::sanitize(&raw);
            prop_assert!(!name.contains('/') && !name.contains('\\'));
        }

        #[test]
        fn canonical_origins_reparse_to_themselves(host in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}", port in 1u16..) {
            let raw = format!("https://{host}:{port}");
            let first = OriginGuard::parse(&raw).expect("valid");
            let second = OriginGuard::parse(&first.origin).expect("canonical");
            prop_assert_eq!(first, second);
        }
    }
}
