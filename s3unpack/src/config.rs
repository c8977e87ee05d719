use url::Url;

/// The configuration settings that control how s3unpack talks to object storage.
///
/// Settings that are specific to one archive (the target bucket and prefix, the archive format,
/// ignore patterns, upload parallelism) are set on [`crate::ArchiveSinkBuilder`] instead.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, the AWS region
    /// is ignored.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The AWS region to use.
    ///
    /// If not set, the region is taken from the AWS config files or environment, falling back to
    /// `us-east-1`.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub aws_region: Option<String>,

    /// The AWS access key ID to use.
    ///
    /// If not set, credentials are obtained the usual way from the AWS config files or
    /// environment.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, requires = "aws_secret_access_key")
    )]
    pub aws_access_key_id: Option<String>,

    /// The AWS secret access key to use together with `aws_access_key_id`.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, requires = "aws_access_key_id")
    )]
    pub aws_secret_access_key: Option<String>,

    /// The chunk size that s3unpack uses for multipart uploads of individual archive entries.
    ///
    /// Multipart uploads will be used for entries larger than `multipart_threshold`, and for
    /// entries whose size isn't known up front.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    ///
    /// Note that the maximum number of chunks in an upload is 10,000, so for very large entries
    /// this chunk size may be overridden if it's smaller than 1/10,000th of the size of the
    /// entry.
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The size threshold s3unpack uses for multipart uploads of individual entries.
    ///
    /// If an entry is larger than this, then it will be uploaded in chunks of
    /// `multipart_chunk_size` bytes each.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB"
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_threshold: byte_unit::Byte,

    /// The maximum number of concurrent part uploads for a single multipart upload.
    ///
    /// This is separate from the number of archive entries uploaded in parallel, so the total
    /// number of requests in flight can be as high as this number times the entry parallelism.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_requests: usize,

    /// How many chunks of entry data may be buffered between the archive reader and the upload of
    /// that entry.
    ///
    /// Once this many chunks are waiting, reading of the archive pauses until the upload catches
    /// up.
    #[cfg_attr(feature = "clap", clap(long, default_value = "8", global = true))]
    pub entry_channel_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        // Keep in sync with the `default_value`s in the clap attributes above
        Self {
            s3_endpoint: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            multipart_threshold: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            max_concurrent_requests: 10,
            entry_channel_depth: 8,
        }
    }
}
