//! Segment naming shared by the cache and the object store
//!
//! Every segment file is named `<12 hex digit id><kind suffix>`, both on
//! local disk (`<data root>/<index>/<name>`) and in the remote backend
//! (`<index>/<name>`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the single-writer marker file inside an index directory
pub const PID_FILENAME: &str = "segstore.pid";

/// Kind of item stored in a segment directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    /// Immutable index segment
    Segment,
    /// Index snapshot
    Snapshot,
}

impl SegmentKind {
    /// All kinds, in the order they are scanned
    pub const ALL: [Self; 2] = [Self::Segment, Self::Snapshot];

    /// File name suffix for this kind, including the leading dot
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Segment => ".seg",
            Self::Snapshot => ".snp",
        }
    }

    /// Kind whose suffix matches `suffix` (with the leading dot)
    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.suffix() == suffix)
    }

    /// Whether a file name carries one of the known segment suffixes
    #[must_use]
    pub fn is_segment_file(name: &str) -> bool {
        Self::ALL.iter().any(|k| name.ends_with(k.suffix()))
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segment => write!(f, "seg"),
            Self::Snapshot => write!(f, "snp"),
        }
    }
}

impl FromStr for SegmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('.') {
            "seg" | "segment" => Ok(Self::Segment),
            "snp" | "snapshot" => Ok(Self::Snapshot),
            other => Err(format!("unknown segment kind: {other}")),
        }
    }
}

/// Canonical identity of one segment file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentName {
    pub kind: SegmentKind,
    pub id: u64,
}

impl SegmentName {
    pub const fn new(kind: SegmentKind, id: u64) -> Self {
        Self { kind, id }
    }

    /// File name used both locally and as the last component of the remote key
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{:012x}{}", self.id, self.kind.suffix())
    }

    /// Parse a file name of the given kind.
    ///
    /// Returns `None` if the suffix is a different kind, and an error if the
    /// suffix matches but the id is not valid hex.
    pub fn parse(name: &str, kind: SegmentKind) -> Option<Result<Self, String>> {
        let stem = name.strip_suffix(kind.suffix())?;
        Some(
            u64::from_str_radix(stem, 16)
                .map(|id| Self { kind, id })
                .map_err(|e| format!("invalid segment id in {name:?}: {e}")),
        )
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}
