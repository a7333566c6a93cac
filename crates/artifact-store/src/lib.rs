//! Artifact storage for Fastpath
//!
//! Packaged artifacts live in a cache directory, one per pipeline stage, under
//! the stable name `exported_<stage>.pkg`. Absent artifacts can be fetched from
//! a [`RemoteStore`].

pub mod remote;
pub mod store;

pub use remote::{download_path, DirectoryRemoteStore, HttpRemoteStore, RemoteStore};
pub use store::{ArtifactSource, ArtifactStore, StoredArtifact, ARTIFACT_EXTENSION};
