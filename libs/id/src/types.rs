//! The worker id type.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::words::{ADJECTIVES, NOUNS};
use crate::IdError;

/// Maximum length of a Kubernetes object name (DNS subdomain).
pub const MAX_ID_LEN: usize = 253;

/// Prefix applied to every generated worker name.
pub const GENERATED_PREFIX: &str = "mc-worker";

/// Length of the random tail on generated names.
pub const SUFFIX_LEN: usize = 5;

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Identifier of a worker in the pool.
///
/// Ids are immutable once created and unique within a registry. They sort
/// lexicographically, which callers may use as a deterministic tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Generates a fresh worker name using the thread-local RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    /// Generates a worker name from the given RNG.
    ///
    /// Names look like `mc-worker-sunny-otter-k3x9q`: two words for people
    /// plus a short random tail, so large pools rarely collide.
    #[must_use]
    pub fn generate_with<R: Rng>(rng: &mut R) -> Self {
        let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
        let noun = NOUNS[rng.random_range(0..NOUNS.len())];
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| char::from(SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())]))
            .collect();
        Self(format!("{GENERATED_PREFIX}-{adjective}-{noun}-{suffix}"))
    }

    /// Parses a worker id, trimming surrounding whitespace.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        if s.len() > MAX_ID_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: MAX_ID_LEN,
            });
        }

        if let Some((position, found)) = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.'))
        {
            return Err(IdError::InvalidCharacter { found, position });
        }

        let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
        let starts_ok = s.chars().next().is_some_and(is_alnum);
        let ends_ok = s.chars().next_back().is_some_and(is_alnum);
        if !starts_ok || !ends_ok {
            return Err(IdError::InvalidBoundary);
        }

        Ok(Self(s.to_string()))
    }

    /// Returns true if this id has the shape of a generated worker name.
    pub fn is_generated(&self) -> bool {
        self.0
            .strip_prefix(GENERATED_PREFIX)
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for WorkerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for WorkerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for WorkerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
