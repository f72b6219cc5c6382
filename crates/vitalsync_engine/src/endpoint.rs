//! Endpoint keys.
//!
//! Anchors and sessions are partitioned by a key derived from the upload
//! URL, so two configurations pointing at different servers never touch each
//! other's state.

use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier derived from an endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointKey(String);

impl EndpointKey {
    /// Derives the key for `url`.
    ///
    /// The URL is normalized first (surrounding whitespace, scheme and host
    /// case, trailing slashes) so equivalent spellings share a key. The key
    /// is the first 16 hex digits of the SHA-256 of the normalized URL.
    pub fn from_url(url: &str) -> Self {
        let digest = Sha256::digest(normalize(url).as_bytes());
        Self(digest[..8].iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(url: &str) -> String {
    let url = url.trim();
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => (String::new(), url),
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };

    format!(
        "{scheme}://{}{}",
        authority.to_ascii_lowercase(),
        path.trim_end_matches('/')
    )
}
