use super::{Bucket, ObjectStorage, PutObjectOutput, PutObjectRequest};
use crate::writers::MultipartChunk;
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_types::region::Region;
use bytes::Bytes;
use futures::StreamExt;
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn, Instrument};
use url::Url;

/// S3 won't accept a multipart upload with more parts than this
const MAX_PARTS: u64 = 10_000;

/// Implementation of [`ObjectStorage`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3 {
    inner: Arc<S3Inner>,
}
struct S3Inner {
    config: Config,
    client: aws_sdk_s3::Client,
}

impl S3 {
    pub(super) async fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(S3Inner {
                client: make_s3_client(&config, None).await,
                config,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3 {
    async fn extract_bucket_from_url(&self, url: &Url) -> Result<Box<dyn Bucket>> {
        // S3 URLs are of the form:
        // s3://bucket/path
        // In URL terms, the `bucket` part is considered the host name.
        let bucket = url
            .host_str()
            .ok_or_else(|| crate::error::MissingBucketSnafu { url: url.clone() }.build())?;

        Ok(Box::new(S3Bucket::new(self, bucket).await?))
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3")
    }
}

#[derive(Clone)]
struct S3Bucket {
    inner: Arc<S3BucketInner>,
}
struct S3BucketInner {
    name: String,

    objstore: S3,

    /// The region this bucket is located in, if it's different from the region specified in the
    /// AWS SDK config.
    ///
    /// If a bucket is in a different region, then we need to use a different
    /// [`aws_sdk_s3::Client`] instance to talk to the S3 APIs when dealing with that bucket.
    region: Option<String>,

    /// The client to use to operate on this bucket.
    client: aws_sdk_s3::Client,
}

impl S3Bucket {
    /// Construct a new instance and validate that the current client has access to the bucket.
    ///
    /// If there is no access to the bucket then fail with an error
    async fn new(objstore: &S3, name: &str) -> Result<Self> {
        debug!(bucket = name, "Validating access to bucket");

        let mut client = objstore.inner.client.clone();

        // If the bucket is in a different region, `head_bucket` will fail and the error will
        // include a header telling us the correct region.  Look for that and handle it properly.
        let region = if let Some(region) = Self::validate_access_and_region(&client, name).await? {
            debug!(bucket = name, %region, "Bucket is in another region; repeating access validation in the correct region");

            client = make_s3_client(&objstore.inner.config, region.clone()).await;

            // Repeat the validation in the bucket's own region.  This can fail if we don't have
            // access; a second redirect means something is badly wrong, but uploads will report
            // the real error if there is one.
            if let Some(other_region) = Self::validate_access_and_region(&client, name).await? {
                warn!(bucket = name, %region, %other_region, "S3 redirected to another region a second time");
            }

            Some(region)
        } else {
            // Bucket is in the default region so no override needed
            None
        };

        debug!(bucket = name, ?region, "Access to bucket is confirmed");

        Ok(Self {
            inner: Arc::new(S3BucketInner {
                name: name.to_string(),
                objstore: objstore.clone(),
                region,
                client,
            }),
        })
    }

    fn config(&self) -> &Config {
        &self.inner.objstore.inner.config
    }

    /// Decide how to upload an object of the given size.
    ///
    /// `None` means the object is small enough for a single `PutObject`; otherwise the chunk size
    /// for a multipart upload.  Unknown sizes are assumed to be large.  For very large objects the
    /// configured chunk size is overridden to keep the part count within what S3 allows.
    fn multipart_chunk_size(&self, key: &str, size_hint: Option<u64>) -> Option<usize> {
        let config = self.config();
        let multipart_chunk_size = (config.multipart_chunk_size.get_bytes() as u64).max(1);
        let multipart_threshold = config.multipart_threshold.get_bytes() as u64;

        match size_hint {
            None => Some(multipart_chunk_size as usize),
            Some(size) if size <= multipart_threshold => None,
            Some(size) => {
                if size.div_ceil(multipart_chunk_size) <= MAX_PARTS {
                    Some(multipart_chunk_size as usize)
                } else {
                    let new_chunk_size = size.div_ceil(MAX_PARTS);
                    warn!(%key, size, multipart_chunk_size, new_chunk_size,
                        "Object size is so large that the requested chunk size will be overridden to keep the total chunk count under 10K");

                    Some(new_chunk_size as usize)
                }
            }
        }
    }

    /// Upload the whole object with a single `PutObject` call
    async fn put_single(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
        tagging: Option<String>,
        metadata: std::collections::HashMap<String, String>,
    ) -> Result<u64> {
        let total_bytes = data.len() as u64;

        debug!(total_bytes, "Uploading unipart object");

        self.inner
            .client
            .put_object()
            .bucket(self.inner.name.clone())
            .key(key)
            .set_content_type(content_type)
            .set_tagging(tagging)
            .set_metadata((!metadata.is_empty()).then_some(metadata))
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(total_bytes)
    }

    /// Upload an object whose data arrives as multipart chunks.
    ///
    /// If the data turns out to fit in a single chunk, it's uploaded with `PutObject` instead.
    #[instrument(skip(self, chunks, content_type, tagging, metadata), fields(bucket = %self.inner.name))]
    async fn put_chunked(
        &self,
        key: &str,
        mut chunks: mpsc::Receiver<Result<MultipartChunk>>,
        content_type: Option<String>,
        tagging: Option<String>,
        metadata: std::collections::HashMap<String, String>,
    ) -> Result<u64> {
        let first = match chunks.recv().await.transpose()? {
            Some(chunk) => chunk,
            None => {
                return self
                    .put_single(key, Bytes::new(), content_type, tagging, metadata)
                    .await
            }
        };
        let second = match chunks.recv().await.transpose()? {
            Some(chunk) => chunk,
            None => {
                return self
                    .put_single(key, first.data, content_type, tagging, metadata)
                    .await
            }
        };

        // S3 requires that multi-part be initialized in advance, then each individual part can be
        // uploaded in whatever order is convenient
        let response = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .set_content_type(content_type)
            .set_tagging(tagging)
            .set_metadata((!metadata.is_empty()).then_some(metadata))
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;
        let upload_id = response
            .upload_id()
            .expect("BUG: multi-part uploads always have upload ID")
            .to_string();

        let leading = futures::stream::iter([Ok(first), Ok(second)]);
        let rest = tokio_stream::wrappers::ReceiverStream::new(chunks);

        let result = self
            .multipart_object_writer(key, &upload_id, leading.chain(rest))
            .await;

        if let Err(e) = &result {
            // Before reporting this error, clean up the remains of the multi-part upload
            error!(?e, bucket = %self.inner.name, %key, %upload_id,
                "Multi-part upload failed; aborting multi-part upload on server side");

            if let Err(e) = self
                .inner
                .client
                .abort_multipart_upload()
                .bucket(self.inner.name.clone())
                .key(key)
                .upload_id(upload_id.clone())
                .send()
                .await
            {
                error!(?e, bucket = %self.inner.name, %key, %upload_id,
                    "Error aborting multi-part upload.  This will remain on the server forever unless there's a lifecycle policy configured");
            }
        }

        result
    }

    /// Upload every chunk as a part of the multipart upload `upload_id`, up to the configured
    /// number of concurrent requests at a time, then complete the upload.
    async fn multipart_object_writer(
        &self,
        key: &str,
        upload_id: &str,
        chunks: impl futures::Stream<Item = Result<MultipartChunk>> + Send,
    ) -> Result<u64> {
        let chunk_futs = chunks.map(|chunk| {
            let me = self.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();

            async move {
                let chunk = chunk?;

                // Our chunking code numbers multipart chunks from 0, but the S3 API expects them
                // to be numbered from 1
                let part_number = chunk.part_number + 1;
                let chunk_size = chunk.data.len();

                let span = tracing::debug_span!("upload chunk", part_number, chunk_size);

                async move {
                    debug!("Uploading multi-part chunk");

                    let response = me
                        .inner
                        .client
                        .upload_part()
                        .bucket(me.inner.name.clone())
                        .key(&key)
                        .upload_id(upload_id)
                        .part_number(part_number as i32)
                        .body(ByteStream::from(chunk.data))
                        .send()
                        .await
                        .with_context(|_| crate::error::UploadPartSnafu {
                            bucket: me.inner.name.clone(),
                            key: key.clone(),
                            part_number,
                        })?;

                    let e_tag = response
                        .e_tag()
                        .expect("BUG: uploaded part missing etag")
                        .to_string();

                    debug!(%e_tag, "Uploaded multi-part chunk");

                    // Once all of the uploads are done we must provide the information about each
                    // part to the CompleteMultipartUpload call, so retain the key bits here
                    let completed_part = CompletedPart::builder()
                        .e_tag(e_tag)
                        .part_number(part_number as i32)
                        .build();

                    Ok::<_, crate::S3UnpackError>((chunk_size, completed_part))
                }
                .instrument(span)
                .await
            }
        });

        debug!("Commencing multi-part upload");

        // `buffer_unordered` polls these chunk uploading futures up to a maximum concurrency
        // level to honor the configured max parallel requests
        let mut uploaded_chunks =
            Box::pin(chunk_futs.buffer_unordered(self.config().max_concurrent_requests.max(1)));

        let mut total_bytes = 0u64;
        let mut completed_parts = Vec::new();

        while let Some(result) = uploaded_chunks.next().await {
            let (chunk_size, completed_part) = result?;

            total_bytes += chunk_size as u64;
            completed_parts.push(completed_part);
        }

        debug!(
            total_parts = completed_parts.len(),
            total_bytes, "All parts uploaded; completing multi-part upload"
        );

        // The parts must be listed in order of part number
        completed_parts.sort_unstable_by_key(|part| part.part_number());

        self.inner
            .client
            .complete_multipart_upload()
            .bucket(self.inner.name.clone())
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(total_bytes)
    }

    /// Perform a HEAD on the bucket to check access.
    ///
    /// If the HEAD check passes, it means the client's configured region is correct, the
    /// configured credentials have access to the bucket, and all is well.  In that case this
    /// function returns `Ok(None)`
    ///
    /// If the HEAD check fails with an error that indicates the bucket is in a different region,
    /// then this will return `Ok(Some($region))`, and the check should be repeated again in that
    /// region.
    ///
    /// If the HEAD check fails for any other error, most likely because the bucket doesn't exist
    /// or the credentials don't have access to it, then this returns the corresponding error.
    async fn validate_access_and_region(
        client: &aws_sdk_s3::Client,
        name: &str,
    ) -> Result<Option<String>> {
        match client.head_bucket().bucket(name).send().await {
            Ok(_) => Ok(None),
            Err(e) => {
                if let Some(response) = e.raw_response() {
                    if response.status().as_u16() == 301 {
                        if let Some(region) = response.headers().get("x-amz-bucket-region") {
                            // This is AWS's way of telling us we have the right bucket, but it is
                            // in another region so we should use the appropriate region endpoint
                            return Ok(Some(region.to_string()));
                        }
                    }
                }

                Err(e).context(crate::error::BucketInvalidOrNotAccessibleSnafu {
                    bucket: name.to_string(),
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[instrument(skip(self, request), fields(bucket = %self.inner.name, key = %request.key, size_hint = ?request.size_hint))]
    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectOutput> {
        let PutObjectRequest {
            key,
            body,
            size_hint,
            content_type,
            tagging,
            metadata,
        } = request;

        let bytes = match self.multipart_chunk_size(&key, size_hint) {
            None => {
                let capacity = size_hint.unwrap_or_default() as usize;
                let data = body.collect_bytes(capacity).await?;

                self.put_single(&key, data, content_type, tagging, metadata)
                    .await?
            }
            Some(chunk_size) => {
                let chunks = crate::writers::multipart(
                    body,
                    chunk_size,
                    self.config().max_concurrent_requests,
                );

                self.put_chunked(&key, chunks, content_type, tagging, metadata)
                    .await?
            }
        };

        Ok(PutObjectOutput { key, bytes })
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .field("region", &self.inner.region)
            .field("client", &"<...>")
            .finish()
    }
}

/// Create a new AWS SDK S3 client, using either an explicit region or the default configuration
/// deduced from the environment
async fn make_s3_client(config: &Config, region: impl Into<Option<String>>) -> aws_sdk_s3::Client {
    let region = region.into().or_else(|| config.aws_region.clone());

    let region_provider = if let Some(region) = region {
        RegionProviderChain::first_try(Region::new(region))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else("us-east-1")
    };

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);

    if let (Some(access_key_id), Some(secret_access_key)) =
        (&config.aws_access_key_id, &config.aws_secret_access_key)
    {
        loader = loader.credentials_provider(aws_credential_types::Credentials::from_keys(
            access_key_id,
            secret_access_key,
            None,
        ));
    }

    let aws_config = loader.load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services generally don't do virtual-host style bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
