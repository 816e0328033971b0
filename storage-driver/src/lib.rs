//! Object-store contract used by the registry.
//!
//! Blobs and manifests are opaque byte objects addressed by bucket and key.
//! A [`Driver`] moves bytes in and out; everything content-addressed is layered
//! on top of it by the registry.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
