//! Archives unpacked into a local Minio server, which speaks the S3 API.
//!
//! These check the S3 bucket implementation end to end: single-part and multipart uploads, object
//! properties, and bucket validation.  The pipeline logic itself is covered against the in-memory
//! bucket in `sink`.
use crate::{progress::TestUploadProgressCallback, Result};
use assert_matches::assert_matches;
use s3unpack::{ArchiveFormat, ArchiveSinkBuilder, S3UnpackError};
use s3unpack_testing::{archives, logging::test_with_logging, minio::MinioServer};
use std::io::Cursor;
use url::Url;

fn target_url(bucket: &str, prefix: &str) -> Url {
    Url::parse(&format!("s3://{bucket}/{prefix}")).expect("test URL is valid")
}

#[test]
#[ignore = "requires minio"]
fn tar_round_trip() -> Result<()> {
    test_with_logging(async move {
        let server = MinioServer::get().await?;
        let bucket = server.create_bucket("tar-round-trip").await?;
        let progress = TestUploadProgressCallback::new();

        let one = archives::random_data(10_000);
        let two = archives::random_data(20_000);
        let archive = archives::tar_archive(&[
            ("one/", None),
            ("one/one.bin", Some(one.as_slice())),
            ("two//two.bin", Some(two.as_slice())),
            ("index.html", Some(&b"<html></html>"[..])),
        ]);

        let builder = ArchiveSinkBuilder::new(server.config(), target_url(&bucket, "test_prefix"))
            .await?;
        let sink = builder.build_with_progress(progress.clone())?;
        let outcome = s3unpack::upload_archive(Cursor::new(archive), sink).await?;
        progress.sanity_check_updates();

        assert_eq!(3, outcome.keys.len());
        assert_eq!(
            vec![
                "test_prefix/index.html",
                "test_prefix/one/one.bin",
                "test_prefix/two/two.bin"
            ],
            server.list_keys(&bucket).await?
        );
        assert_eq!(
            &one[..],
            &server.get_object_bytes(&bucket, "test_prefix/one/one.bin").await?[..]
        );
        assert_eq!(
            &two[..],
            &server.get_object_bytes(&bucket, "test_prefix/two/two.bin").await?[..]
        );

        let head = server
            .aws_client()
            .await?
            .head_object()
            .bucket(&bucket)
            .key("test_prefix/index.html")
            .send()
            .await?;
        assert_eq!(Some("text/html"), head.content_type());

        Ok(())
    })
}

/// An entry bigger than the multipart threshold goes up as a multipart upload
#[test]
#[ignore = "requires minio"]
fn large_entry_uses_multipart_upload() -> Result<()> {
    test_with_logging(async move {
        let server = MinioServer::get().await?;
        let bucket = server.create_bucket("multipart").await?;
        let progress = TestUploadProgressCallback::new();

        let big = archives::random_data(20 * 1024 * 1024);
        let archive = archives::tar_archive(&[
            ("big.bin", Some(big.as_slice())),
            ("small.txt", Some(&b"small"[..])),
        ]);

        let builder = ArchiveSinkBuilder::new(server.config(), target_url(&bucket, "")).await?;
        let sink = builder.build_with_progress(progress.clone())?;
        let outcome = s3unpack::upload_archive(Cursor::new(archive), sink).await?;
        progress.sanity_check_updates();

        assert_eq!(big.len() as u64 + 5, outcome.total_bytes);
        assert_eq!(
            &big[..],
            &server.get_object_bytes(&bucket, "big.bin").await?[..]
        );

        // Multipart uploads get an ETag like `"<md5 of part md5s>-<part count>"`
        let head = server
            .aws_client()
            .await?
            .head_object()
            .bucket(&bucket)
            .key("big.bin")
            .send()
            .await?;
        assert_matches!(head.e_tag(), Some(etag) if etag.trim_matches('"').ends_with("-3"));

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn zip_round_trip() -> Result<()> {
    test_with_logging(async move {
        let server = MinioServer::get().await?;
        let bucket = server.create_bucket("zip-round-trip").await?;

        let data = archives::random_data(100_000);
        let archive = archives::zip_archive(&[
            ("dir/", None),
            ("dir/data.bin", Some(data.as_slice())),
        ]);

        let mut builder =
            ArchiveSinkBuilder::new(server.config(), target_url(&bucket, "zipped")).await?;
        builder.format(ArchiveFormat::Zip);

        s3unpack::upload_archive(Cursor::new(archive), builder.build()?).await?;

        assert_eq!(vec!["zipped/dir/data.bin"], server.list_keys(&bucket).await?);
        assert_eq!(
            &data[..],
            &server.get_object_bytes(&bucket, "zipped/dir/data.bin").await?[..]
        );

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn missing_bucket_is_rejected() -> Result<()> {
    test_with_logging(async move {
        let server = MinioServer::get().await?;

        let result =
            ArchiveSinkBuilder::new(server.config(), target_url("does-not-exist", "prefix")).await;

        assert_matches!(
            result,
            Err(S3UnpackError::BucketInvalidOrNotAccessible { bucket, .. }) if bucket == "does-not-exist"
        );

        Ok(())
    })
}
