//! # Europa container registry
//!
//! A multi-backend registry following the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec).
//! It stores images locally, reaches Docker Hub, Google Container Registry, ECR
//! and private registries through one [`Registry`](adapter::Registry) interface,
//! and moves images between repositories.
//!
//! ## Features
//!
//! - Distribution API for pushes, pulls, uploads and listings ([`RegistryBuilder`])
//! - Content-addressed manifests and blobs on any `storage` backend
//! - Image copies between any two repositories ([`CopyImageBetweenRepos`])
//! - Promotion pipelines run on push ([`pipeline`])
//! - Mirror replication with a per-repository lock ([`sync`])
//!
//! ## Example
//!
//! ```no_run
//! use europa::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .domain("acme")
//!     .build()?;
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

pub mod adapter;
mod api;
pub mod blob;
pub mod config;
mod context;
mod copy;
pub mod credentials;
mod digest;
pub mod directory;
mod error;
pub mod manifest;
mod objects;
pub mod pipeline;
mod push;
pub mod repo;
pub mod sync;

pub use api::{RegistryBuilder, RegistryState};
pub use context::RegistryContext;
pub use copy::{CopyImageBetweenRepos, CopyImageBetweenReposBuilder};
pub use digest::{Digest, DigestReader, Reference};
pub use error::{RegistryError, RegistryResult};
pub use objects::ObjectStore;
pub use push::{ManifestPush, PushOutcome, push_manifest};
