pub mod atomic;
pub mod store;

use sha2::{Digest, Sha256};
use url::form_urlencoded;

pub use atomic::{write_atomic, StagedFile};
pub use store::{StagedWrite, StateRecord, StateStore};

/// Longest percent-encoded stem kept readable; longer ones become digests.
/// Leaves room for the extension and the temp-file prefix/suffix under the
/// usual 255-byte file name limit.
const MAX_ENCODED_STEM: usize = 120;

/// Marks a digest stem; `~` is always percent-encoded by `byte_serialize`
const DIGEST_PREFIX: char = '~';

/// File-name-safe stem for a domain
///
/// Short names are percent-encoded (`/`, `\` and friends included) so they
/// can be listed back. Names whose encoding would not fit in a file name are
/// stored under a SHA-256 digest; the record itself carries the real domain.
pub(crate) fn domain_stem(domain: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(domain.as_bytes()).collect();
    if encoded.len() <= MAX_ENCODED_STEM {
        return encoded;
    }

    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    format!("{DIGEST_PREFIX}{:x}", hasher.finalize())
}

/// Domain for a percent-encoded stem, or `None` for a digest stem
pub(crate) fn decode_stem(stem: &str) -> Option<String> {
    if stem.starts_with(DIGEST_PREFIX) {
        return None;
    }
    Some(
        form_urlencoded::parse(stem.as_bytes())
            .next()
            .map(|(key, _)| key.into_owned())
            .unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_stem_round_trips() {
        let stem = domain_stem("a b/c");
        assert_eq!(stem, "a+b%2Fc");
        assert_eq!(decode_stem(&stem).as_deref(), Some("a b/c"));
    }

    #[test]
    fn test_long_stem_is_bounded_digest() {
        let domain = "量".repeat(42);
        let stem = domain_stem(&domain);
        assert_eq!(stem.len(), 65);
        assert!(decode_stem(&stem).is_none());
        assert_ne!(stem, domain_stem(&"量".repeat(41)));

        let longest = "\u{7f}".repeat(128);
        assert!(domain_stem(&longest).len() <= MAX_ENCODED_STEM);
    }
}
