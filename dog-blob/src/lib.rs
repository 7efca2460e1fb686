//! # dog-blob: verified blob storage for DogRS applications
//!
//! `dog-blob` pairs a structured metadata repository with a raw content
//! store and keeps the two consistent. Every upload is streamed through an
//! MD5 digest and a size limit before its record becomes visible; records
//! carry a revision used for compare-and-swap updates and deletes.
//!
//! ## Key Features
//!
//! - **Two-phase create**: reserve a record, stream the content, finalize
//!   with the computed digest and size. Failures clean up after themselves.
//! - **Integrity checks**: uploads larger than [`SIZE_MAXIMUM`] or whose
//!   digest differs from the caller's are rejected and leave no trace.
//! - **Revision conditions**: `get`, `update`, `delete` and `destroy` accept
//!   an optional [`Condition`]; a stale revision behaves like a missing record.
//! - **Soft delete**: blob records are tombstoned before their content is
//!   removed and the record destroyed. Device logs are destroyed directly.
//! - **Pluggable backends**: in-memory repositories and content store for
//!   tests, an S3-compatible content store, and PostgreSQL repositories
//!   behind the `postgres` feature.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use dog_blob::memory::{MemoryBlobRepository, MemoryContentStore};
//! use dog_blob::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> BlobResult<()> {
//! let client = BlobClient::new(
//!     Arc::new(MemoryBlobRepository::new()),
//!     Arc::new(MemoryContentStore::new()),
//!     BlobConfig::default(),
//! );
//!
//! let ctx = BlobCtx::new();
//! let blob = client
//!     .create(
//!         &ctx,
//!         "user-123",
//!         BlobContent::from_bytes("hello").with_media_type("text/plain"),
//!     )
//!     .await?;
//! assert_eq!(blob.digest_md5.as_deref(), Some("XUFAKrxLKna5cZ2REBfFkg=="));
//!
//! let opened = client.get_content(&ctx, &blob.id).await?;
//! assert_eq!(opened.map(|content| content.size), Some(Some(5)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │  BlobClient / DeviceLogsClient   │  ← orchestration, verification, cleanup
//! ├────────────────┬─────────────────┤
//! │  Repository    │  ContentStore   │  ← metadata / raw bytes
//! └────────────────┴─────────────────┘
//! ```

mod blob;
mod client;
mod config;
pub mod content;
mod device_logs;
mod device_logs_client;
pub mod digest;
mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod repository;
mod s3_store;
pub mod store;
pub mod testing;
mod types;

pub use blob::{
    validate_digest_md5, validate_media_type, Blob, BlobCreate, BlobFilter, BlobStatus,
    BlobUpdate, Liveness,
};
pub use client::BlobClient;
pub use config::{BlobConfig, GET_MANY_CONCURRENCY, SIZE_MAXIMUM};
pub use content::{BlobContent, DeviceLogsContent, OpenedContent, OpenedDeviceLogs};
pub use device_logs::{DeviceLogsBlob, DeviceLogsCreate, DeviceLogsFilter, DeviceLogsUpdate};
pub use device_logs_client::DeviceLogsClient;
pub use error::{BlobError, BlobResult};
pub use repository::{BlobRepository, DeviceLogsRepository, IdGenerator};
pub use s3_store::{S3Config, S3ContentStore};
pub use store::{
    ContentKeyStrategy, ContentStore, DefaultKeyStrategy, FlatKeyStrategy, PutOptions,
};
pub use types::{BlobCtx, BlobId, ByteStream, Condition, Pagination, PAGINATION_SIZE_MAXIMUM};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Blob, BlobClient, BlobConfig, BlobContent, BlobCtx, BlobError, BlobFilter, BlobId,
        BlobRepository, BlobResult, BlobStatus, ByteStream, Condition, ContentStore,
        DeviceLogsBlob, DeviceLogsClient, DeviceLogsContent, DeviceLogsFilter,
        DeviceLogsRepository, Pagination,
    };
}
