#![doc = include_str!("../README.md")]

mod async_bridge;
mod body;
mod config;
mod container;
mod coordinator;
mod decompress;
mod error;
mod filter;
mod keys;
mod objstore;
mod progress;
mod sink;
mod slots;
mod writers;

pub use body::EntryBody;
pub use config::Config;
pub use container::{ArchiveFormat, EntryHeader, EntryKind};
pub use error::{Result, S3UnpackError};
pub use filter::EntryFilter;
pub use keys::{build_key, infer_content_type};
pub use objstore::{Bucket, PutObjectOutput, PutObjectRequest};
pub use progress::{SkipReason, UploadProgressCallback};
pub use sink::{
    upload_archive, ArchiveSink, ArchiveSinkBuilder, EntryObserver, ObjectAnnotations,
    UploadOutcome, DEFAULT_MAX_PARALLEL,
};
