use crate::{Config, EntryBody, Result};
use dyn_clone::DynClone;
use std::collections::HashMap;
use url::Url;

mod s3;

/// An object storage system like S3.
///
/// Not all object storage systems expose an S3-compatible API, so to ensure we can add support for
/// those other systems in the future, the object storage implementation is abstracted behind a
/// trait.
///
/// Use [`ObjectStorageFactory`] to create an instance of this trait.
#[async_trait::async_trait]
pub(crate) trait ObjectStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Given a URL that contains a bucket (and possibly a key prefix also), extract the bucket
    /// name, validate it against the underlying object storage system, and if it's valid then
    /// return the bucket to the caller
    async fn extract_bucket_from_url(&self, url: &Url) -> Result<Box<dyn Bucket>>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// A bucket which is like a namespace in which object storage systems store named objects.
///
/// Archive entries are written to a bucket one object per entry.  The S3 implementation is
/// obtained from an `s3://` URL by [`crate::ArchiveSinkBuilder::new`]; other implementations can
/// be supplied with [`crate::ArchiveSinkBuilder::with_bucket`].
///
/// Implementations should be cheap to clone, ideally the cost of increasing the ref count on an
/// `Arc`, since each concurrent upload holds its own clone.
#[async_trait::async_trait]
pub trait Bucket: DynClone + std::fmt::Debug + Sync + Send + 'static {
    fn name(&self) -> &str;

    /// Upload one object, reading its data from `request.body`.
    ///
    /// The body must be read to the end or dropped before this returns, even on failure.
    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectOutput>;
}

dyn_clone::clone_trait_object!(Bucket);

/// Everything needed to write one archive entry as an object
#[derive(Debug)]
pub struct PutObjectRequest {
    /// The full object key, already including the key prefix
    pub key: String,

    pub body: EntryBody,

    /// The size of the object if it's known in advance.  Used to choose between a single
    /// `PutObject` and a multipart upload.
    pub size_hint: Option<u64>,

    pub content_type: Option<String>,

    /// Object tags, encoded as URL query parameters like `key1=value1&key2=value2`
    pub tagging: Option<String>,

    /// User-defined object metadata
    pub metadata: HashMap<String, String>,
}

/// The result of a successful [`Bucket::put_object`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutObjectOutput {
    pub key: String,

    /// The number of bytes written to the object
    pub bytes: u64,
}

/// Constructs [`ObjectStorage`] implementations on demand.
#[derive(Debug)]
pub(crate) struct ObjectStorageFactory {
    config: Config,
}

impl ObjectStorageFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Given the URL to an object storage bucket or prefix, determine which implementation
    /// handles that particular object storage technology and return an instance of it.
    ///
    /// If the URL isn't recognized as being supported by s3unpack, an error is returned
    #[allow(clippy::wrong_self_convention)] // For a factory object I think it's obvious what this means
    pub async fn from_url(&self, url: &Url) -> Result<Box<dyn ObjectStorage>> {
        if url.scheme() == "s3" {
            Ok(self.s3().await)
        } else {
            crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }.fail()
        }
    }

    /// Return a [`ObjectStorage`] implementation for S3 or an S3-compatible API
    pub async fn s3(&self) -> Box<dyn ObjectStorage> {
        // A new client every time.  `Client` holds on to `hyper` resources which are tied to the
        // runtime that created them, and tests run many runtimes in one process.
        Box::new(s3::S3::new(self.config.clone()).await)
    }
}

/// Paths from URLs like `s3://bucket/prefix/object` always start with `/`, but that's not
/// actually part of the S3 object key.  Fix such paths.
pub(crate) fn url_path_to_prefix(url: &Url) -> String {
    let path = url.path();

    path.strip_prefix('/').unwrap_or(path).to_string()
}
