//! Content types distinguished in on-disk paths.

use std::fmt;

/// The four kinds of files the engine persists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Full object bytes.
    Replica,
    /// One data or parity fragment.
    Slice,
    /// Metadata sidecar.
    Meta,
    /// Scratch space; never survives a scan.
    Work,
}

impl ContentType {
    /// Directory name under the bucket root.
    #[must_use]
    pub const fn dir(&self) -> &'static str {
        match self {
            Self::Replica => "obj",
            Self::Slice => "slice",
            Self::Meta => "meta",
            Self::Work => "work",
        }
    }

    #[must_use]
    pub fn from_dir(dir: &str) -> Option<Self> {
        match dir {
            "obj" => Some(Self::Replica),
            "slice" => Some(Self::Slice),
            "meta" => Some(Self::Meta),
            "work" => Some(Self::Work),
            _ => None,
        }
    }

    /// All content types, scan order: metadata first so orphan detection can
    /// index sidecars before visiting payload files.
    pub const ALL: [Self; 4] = [Self::Meta, Self::Replica, Self::Slice, Self::Work];
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_roundtrip() {
        for ct in ContentType::ALL {
            assert_eq!(ContentType::from_dir(ct.dir()), Some(ct));
        }
        assert_eq!(ContentType::from_dir("bogus"), None);
    }
}
