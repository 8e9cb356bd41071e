use std::fmt;

use bytes::Bytes;

/// Cache lookup key: a backend handle digest plus a cookie.
///
/// Two keys are equal only when both the digest bytes and the cookie are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    digest: Bytes,
    cookie: u64,
}

impl HandleKey {
    /// Key with the default cookie.
    #[must_use]
    pub fn new(digest: impl Into<Bytes>) -> Self {
        Self::with_cookie(digest, 0)
    }

    /// Key with an explicit cookie.
    #[must_use]
    pub fn with_cookie(digest: impl Into<Bytes>, cookie: u64) -> Self {
        Self {
            digest: digest.into(),
            cookie,
        }
    }

    /// The handle digest.
    #[must_use]
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// The cookie.
    #[must_use]
    pub fn cookie(&self) -> u64 {
        self.cookie
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.digest.iter().take(8) {
            write!(f, "{b:02x}")?;
        }
        write!(f, "/{}", self.cookie)
    }
}

/// Process-unique id of a cached entry, used where a `Copy` key is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
