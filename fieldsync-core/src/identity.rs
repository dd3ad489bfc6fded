//! Rendezvous namespaces and participant identities.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Prefix shared by every namespace.
pub const NAMESPACE_PREFIX: &str = "p2p-sync-";

/// Namespace used when the public address cannot be determined.
pub const FALLBACK_NAMESPACE: &str = "p2p-sync-public-room";

const SUFFIX_LEN: usize = 8;
const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Rendezvous group. Peers only consider identities under the same namespace discoverable.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Namespace(String);

impl Namespace {
    /// Namespace for a public network address, e.g. `p2p-sync-1.2.3.4`.
    pub fn from_address(address: &str) -> Self {
        Namespace(format!("{NAMESPACE_PREFIX}{address}"))
    }

    /// Shared namespace for sessions whose address lookup failed.
    pub fn fallback() -> Self {
        Namespace(FALLBACK_NAMESPACE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Participant identity: `namespace-suffix`. Generated once per session.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Generate a fresh identity under `namespace` with a random base-36 suffix.
    pub fn generate(namespace: &Namespace) -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect();
        Identity(format!("{namespace}-{suffix}"))
    }

    /// Wrap an identity reported by the transport.
    pub fn new(raw: impl Into<String>) -> Self {
        Identity(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this identity was generated under `namespace`.
    pub fn in_namespace(&self, namespace: &Namespace) -> bool {
        self.0
            .strip_prefix(namespace.as_str())
            .is_some_and(|rest| rest.starts_with('-'))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
