//! Integration tests of the pipeline writing to real object storage.
//!
//! The tests that talk to an object store run against [minio](https://min.io), which must be
//! installed locally (see `s3unpack_testing::minio`).  They're marked `ignore` so a plain
//! `cargo test` doesn't need it; run them with `cargo test -- --ignored`.
use crate::Result;
use assert_matches::assert_matches;
use s3unpack::{ArchiveSinkBuilder, Config, S3UnpackError};
use url::Url;

mod minio;

#[test]
fn unsupported_url_scheme_is_rejected() -> Result<()> {
    s3unpack_testing::logging::test_with_logging(async move {
        let url = Url::parse("https://example.com/bucket/prefix")?;

        let result = ArchiveSinkBuilder::new(Config::default(), url).await;

        assert_matches!(result, Err(S3UnpackError::UnsupportedObjectStorage { .. }));

        Ok(())
    })
}
