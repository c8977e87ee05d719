use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::{
    complete_multipart_upload::CompleteMultipartUploadError,
    create_multipart_upload::CreateMultipartUploadError, head_bucket::HeadBucketError,
    put_object::PutObjectError, upload_part::UploadPartError,
};
use snafu::prelude::*;
use url::Url;

pub type Result<T, E = S3UnpackError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum S3UnpackError {
    #[snafu(display("The URL '{url}' doesn't correspond to any supported object storage technology.  Supported URL schemes are: s3"))]
    UnsupportedObjectStorage { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: SdkError<HeadBucketError>,
    },

    #[snafu(display("The maximum number of parallel uploads must be at least 1 (got {max_parallel})"))]
    InvalidMaxParallel { max_parallel: usize },

    #[snafu(display("The ignore pattern '{pattern}' is not a valid regular expression"))]
    InvalidIgnorePattern {
        pattern: String,
        source: regex::Error,
    },

    #[snafu(display("Error reading from the input stream"))]
    ReadInput { source: std::io::Error },

    #[snafu(display("The archive sink is no longer accepting input; the upload pipeline has already shut down"))]
    SinkClosed,

    #[snafu(display("Error reading tar archive"))]
    TarRead { source: std::io::Error },

    #[snafu(display("Error reading zip archive"))]
    ZipRead { source: std::io::Error },

    #[snafu(display("Zip archive entry '{path}' can't be extracted: {reason}"))]
    UnsupportedZipEntry { path: String, reason: String },

    #[snafu(display("Error reading the data of archive entry '{path}'"))]
    EntryRead {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("The archive ended before all of the data of entry '{path}' was read"))]
    EntryAbandoned { path: String },

    #[snafu(display("Error uploading object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: SdkError<PutObjectError>,
    },

    #[snafu(display("Error starting multi-part upload of object '{key}' to S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CreateMultipartUploadError>,
    },

    #[snafu(display(
        "Error uploading part {part_number} of object '{key}' to S3 bucket '{bucket}'"
    ))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: usize,
        source: SdkError<UploadPartError>,
    },

    #[snafu(display("Error completing multi-part upload of object '{key}' to S3 bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CompleteMultipartUploadError>,
    },

    /// Failure reported by a [`crate::Bucket`] implementation that isn't backed by the AWS SDK.
    #[snafu(display("Object storage rejected object '{key}' in bucket '{bucket}'"))]
    StorageBackend {
        bucket: String,
        key: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[snafu(display("A blocking task panicked or was canceled"))]
    SpawnBlocking { source: tokio::task::JoinError },

    #[snafu(display("An async task panicked or was canceled"))]
    Spawn { source: tokio::task::JoinError },
}
