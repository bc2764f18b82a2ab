//! Artifact storage for Conveyor.
//!
//! Job artifacts are packed as tar+zstd archives on the local filesystem,
//! with a JSON metadata record per handle carrying the checksum and expiry.

pub mod archive;
pub mod store;

pub use archive::{ARCHIVE_EXTENSION, create_archive, extract_archive};
pub use store::{ArtifactMeta, FilesystemArtifactStore};
