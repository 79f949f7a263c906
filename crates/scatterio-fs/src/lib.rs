//! ScatterIO filesystem layer — mountpath layout and content-file
//! operations.
//!
//! Mountpath layout:
//! ```text
//! <root>/<bucket>/obj/<name>      REPLICA — full object bytes
//! <root>/<bucket>/slice/<name>    SLICE   — one data or parity fragment
//! <root>/<bucket>/meta/<name>     META    — sidecar for the local replica/slice
//! <root>/<bucket>/work/<name>.*   WORK    — scratch files, unique suffix
//! ```
//!
//! `build_path` and `parse_path` round-trip; everything the engine persists
//! is a content file plus its sidecar, so crash recovery is a directory walk.

pub mod content;
pub mod mountpath;

pub use content::ContentType;
pub use mountpath::{Mountpath, Mountpaths};
