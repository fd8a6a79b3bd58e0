//! Carry-over buffer for records split across slice files.

/// Holds the trailing fragment (shorter than one record) of the previous
/// read so the next read can complete it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteWindowCache {
    fragment: Vec<u8>,
}

impl ByteWindowCache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fragment: Vec::new(),
        }
    }

    /// Take the cached fragment, leaving the cache empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.fragment)
    }

    /// Replace the cached fragment.
    pub fn store(&mut self, fragment: &[u8]) {
        self.fragment.clear();
        self.fragment.extend_from_slice(fragment);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fragment.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragment.is_empty()
    }

    pub fn clear(&mut self) {
        self.fragment.clear();
    }
}
