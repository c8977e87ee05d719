//! Tests of the complete upload pipeline, from raw archive bytes to stored objects, using the
//! in-memory bucket from `s3unpack-testing` in place of real object storage.
use crate::{progress::TestUploadProgressCallback, Result};
use assert_matches::assert_matches;
use more_asserts::*;
use s3unpack::{
    ArchiveFormat, ArchiveSinkBuilder, Config, EntryKind, S3UnpackError, SkipReason,
    UploadOutcome,
};
use s3unpack_testing::archives::{self, TestEntry};
use s3unpack_testing::logging::test_with_logging;
use s3unpack_testing::memory::MemoryBucket;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Used wherever a test waits for something that should happen almost immediately
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

fn builder(bucket: &MemoryBucket, prefix: &str) -> ArchiveSinkBuilder {
    ArchiveSinkBuilder::with_bucket(Config::default(), Box::new(bucket.clone()), prefix)
}

/// Run `archive` through a sink made from `builder`, with progress recorded to `progress`
async fn upload(
    builder: ArchiveSinkBuilder,
    archive: Vec<u8>,
    progress: &TestUploadProgressCallback,
) -> s3unpack::Result<UploadOutcome> {
    let sink = builder.build_with_progress(progress.clone())?;

    s3unpack::upload_archive(Cursor::new(archive), sink).await
}

fn sorted(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys
}

#[test]
fn keys_are_normalized_and_directories_skipped() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let archive = archives::tar_archive(&[
            ("one/", None),
            ("one//one.txt", Some(&b"one"[..])),
            ("two/./two.txt", Some(&b"two"[..])),
            ("three/../three.txt", Some(&b"three"[..])),
        ]);

        let outcome = upload(builder(&bucket, "prefix"), archive, &progress).await?;
        progress.sanity_check_updates();

        let expected = vec![
            "prefix/one/one.txt".to_string(),
            "prefix/three.txt".to_string(),
            "prefix/two/two.txt".to_string(),
        ];
        assert_eq!(expected, sorted(outcome.keys.clone()));
        assert_eq!(expected, bucket.keys());
        assert_eq!(4, outcome.total_entries);
        assert_eq!(11, outcome.total_bytes);

        assert_eq!(
            &b"one"[..],
            &bucket.object("prefix/one/one.txt").unwrap().data[..]
        );
        assert_eq!(
            vec![("one/".to_string(), SkipReason::Directory)],
            progress.entries_skipped()
        );

        Ok(())
    })
}

#[test]
fn two_entry_round_trip() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let archive = archives::tar_archive(&[
            ("one.txt", Some(&b"one"[..])),
            ("two.txt", Some(&b"two"[..])),
        ]);

        upload(builder(&bucket, "test_prefix"), archive, &progress).await?;
        progress.sanity_check_updates();

        assert_eq!(
            &b"one"[..],
            &bucket.object("test_prefix/one.txt").unwrap().data[..]
        );
        assert_eq!(
            &b"two"[..],
            &bucket.object("test_prefix/two.txt").unwrap().data[..]
        );

        Ok(())
    })
}

#[test]
fn empty_prefix_puts_objects_at_bucket_root() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let archive = archives::tar_archive(&[
            ("/abs/file.txt", Some(&b"x"[..])),
            ("rel.txt", Some(&b"y"[..])),
        ]);

        upload(builder(&bucket, ""), archive, &progress).await?;

        assert_eq!(vec!["abs/file.txt", "rel.txt"], bucket.keys());

        Ok(())
    })
}

#[test]
fn ignored_entries_are_skipped() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let archive = archives::tar_archive(&[
            ("one.txt", Some(&b"one"[..])),
            ("two.txt", Some(&b"two"[..])),
            ("dir/one.txt.bak", Some(&b"backup"[..])),
            ("dir/three.txt", Some(&b"three"[..])),
        ]);

        let mut builder = builder(&bucket, "prefix");
        builder.add_ignore(r"one\.txt")?;

        let outcome = upload(builder, archive, &progress).await?;
        progress.sanity_check_updates();

        assert_eq!(vec!["prefix/dir/three.txt", "prefix/two.txt"], bucket.keys());
        assert_eq!(2, outcome.keys.len());
        assert_eq!(4, outcome.total_entries);

        let mut skipped = progress.entries_skipped();
        skipped.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            vec![
                ("dir/one.txt.bak".to_string(), SkipReason::Ignored),
                ("one.txt".to_string(), SkipReason::Ignored),
            ],
            skipped
        );

        Ok(())
    })
}

#[test]
fn symlinks_are_skipped() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let archive = archives::tar_archive_with_entries(&[
            TestEntry::File {
                name: "target.txt",
                data: b"data",
            },
            TestEntry::Symlink {
                name: "link.txt",
                target: "target.txt",
            },
        ]);

        upload(builder(&bucket, "p"), archive, &progress).await?;
        progress.sanity_check_updates();

        assert_eq!(vec!["p/target.txt"], bucket.keys());
        assert_eq!(
            vec![("link.txt".to_string(), SkipReason::Special)],
            progress.entries_skipped()
        );

        Ok(())
    })
}

/// Many more entries than upload slots, with slow uploads, never runs more than the maximum at
/// once and still uploads everything intact
#[test]
fn parallelism_is_bounded() -> Result<()> {
    test_with_logging(async move {
        const ENTRIES: usize = 25;
        const MAX_PARALLEL: usize = 3;

        let bucket = MemoryBucket::builder("test")
            .delay(Duration::from_millis(20))
            .build();
        let progress = TestUploadProgressCallback::new();

        let contents = (0..ENTRIES)
            .map(|i| (format!("file{i:02}.bin"), archives::random_data(1024 + i * 100)))
            .collect::<Vec<_>>();
        let entries = contents
            .iter()
            .map(|(name, data)| (name.as_str(), Some(data.as_slice())))
            .collect::<Vec<_>>();
        let archive = archives::tar_archive(&entries);

        let mut builder = builder(&bucket, "prefix");
        builder.max_parallel(MAX_PARALLEL);

        let outcome = upload(builder, archive, &progress).await?;
        progress.sanity_check_updates();

        assert_eq!(ENTRIES, outcome.keys.len());
        assert_le!(bucket.max_concurrent_uploads(), MAX_PARALLEL);
        assert_ge!(bucket.max_concurrent_uploads(), 1);

        for (name, data) in &contents {
            let object = bucket
                .object(&format!("prefix/{name}"))
                .unwrap_or_else(|| panic!("{name} wasn't uploaded"));
            assert_eq!(&data[..], &object.data[..]);
            assert_eq!(Some(data.len() as u64), object.size_hint);
        }

        Ok(())
    })
}

/// Uploads start in archive order, even when some have to wait for a free slot
#[test]
fn uploads_start_in_archive_order() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::builder("test")
            .delay(Duration::from_millis(5))
            .build();
        let progress = TestUploadProgressCallback::new();

        let names = (0..10).map(|i| format!("{i}.txt")).collect::<Vec<_>>();
        let entries = names
            .iter()
            .map(|name| (name.as_str(), Some(&b"data"[..])))
            .collect::<Vec<_>>();

        let mut builder = builder(&bucket, "");
        builder.max_parallel(2);

        upload(builder, archives::tar_archive(&entries), &progress).await?;

        assert_eq!(names, progress.uploads_started());

        Ok(())
    })
}

/// The whole archive is read while the uploads are still running; the operation finishes only
/// after they settle
#[test]
fn archive_drains_before_uploads_settle() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::builder("test").gated().build();
        let progress = TestUploadProgressCallback::new();

        let archive = archives::tar_archive(&[
            ("a.txt", Some(&b"a"[..])),
            ("b.txt", Some(&b"b"[..])),
        ]);
        let sink = builder(&bucket, "prefix").build_with_progress(progress.clone())?;
        let upload = tokio::spawn(s3unpack::upload_archive(Cursor::new(archive), sink));

        tokio::time::timeout(WAIT_TIMEOUT, async {
            while !progress.has_drained() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        tokio::time::timeout(WAIT_TIMEOUT, bucket.wait_for_uploads_started(2)).await?;

        assert!(!upload.is_finished());
        assert!(bucket.keys().is_empty());

        bucket.open_gate();
        let outcome = upload.await??;
        progress.sanity_check_updates();

        assert_eq!(
            vec!["prefix/a.txt".to_string(), "prefix/b.txt".to_string()],
            sorted(outcome.keys)
        );

        Ok(())
    })
}

/// Uploads of the first entries finish while the rest of the archive hasn't even arrived yet
#[test]
fn uploads_settle_before_archive_drains() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        // One 512 byte header plus one 512 byte block of data per entry
        let archive = archives::tar_archive(&[
            ("a.txt", Some(&b"a"[..])),
            ("b.txt", Some(&b"b"[..])),
        ]);
        let (first_entry, rest) = archive.split_at(1024);

        let mut sink = builder(&bucket, "prefix").build_with_progress(progress.clone())?;
        sink.write(first_entry.to_vec()).await?;

        tokio::time::timeout(WAIT_TIMEOUT, bucket.wait_for_objects(1)).await?;
        assert_eq!(vec!["prefix/a.txt"], bucket.keys());
        assert!(!progress.has_drained());

        sink.write(rest.to_vec()).await?;
        let outcome = sink.finish().await?;
        progress.sanity_check_updates();

        assert_eq!(2, outcome.keys.len());
        assert_eq!(archive.len() as u64, outcome.archive_bytes);

        Ok(())
    })
}

/// The first failed upload fails the operation.  Entries after it are drained but not uploaded.
#[test]
fn upload_failure_is_reported() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::builder("test")
            .fail_key("prefix/b.txt")
            .build();
        let progress = TestUploadProgressCallback::new();

        let archive = archives::tar_archive(&[
            ("a.txt", Some(&b"a"[..])),
            ("b.txt", Some(&b"b"[..])),
            ("c.txt", Some(&b"c"[..])),
            ("d.txt", Some(&b"d"[..])),
        ]);

        let mut builder = builder(&bucket, "prefix");
        builder.max_parallel(1);

        let result = upload(builder, archive, &progress).await;

        assert_matches!(
            result,
            Err(S3UnpackError::StorageBackend { key, .. }) if key == "prefix/b.txt"
        );
        assert_eq!(vec!["prefix/a.txt"], bucket.keys());
        assert_eq!(vec!["prefix/b.txt".to_string()], progress.uploads_failed());
        assert!(!progress.has_finished());

        // Every entry was still read, so the input was consumed to the end
        assert_eq!(4, progress.entries_received().len());
        assert!(progress.has_drained());

        Ok(())
    })
}

#[test]
fn garbage_tar_input_fails() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let garbage = b"this is not an archive\n".repeat(100);
        let result = upload(builder(&bucket, "prefix"), garbage, &progress).await;

        assert_matches!(result, Err(S3UnpackError::TarRead { .. }));
        assert!(bucket.keys().is_empty());

        Ok(())
    })
}

#[test]
fn garbage_zip_input_fails() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let garbage = b"this is not an archive\n".repeat(100);
        let mut builder = builder(&bucket, "prefix");
        builder.format(ArchiveFormat::Zip);

        let result = upload(builder, garbage, &progress).await;

        assert_matches!(result, Err(S3UnpackError::ZipRead { .. }));
        assert!(bucket.keys().is_empty());

        Ok(())
    })
}

/// A failure of the input itself, rather than of its contents, fails the operation
#[test]
fn input_failure_is_reported() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");

        let mut sink = builder(&bucket, "prefix").build()?;
        sink.fail_input(S3UnpackError::ReadInput {
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "input went away"),
        })
        .await?;

        let result = sink.finish().await;

        assert_matches!(result, Err(S3UnpackError::ReadInput { source }) if source.kind() == std::io::ErrorKind::BrokenPipe);

        Ok(())
    })
}

/// An archive that ends in the middle of an entry's data fails the operation without storing a
/// shortened object for that entry
#[test]
fn truncated_entry_is_not_stored() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let big = archives::random_data(100_000);
        let mut archive =
            archives::tar_archive(&[("a.txt", Some(&b"aaa"[..])), ("big.bin", Some(&big[..]))]);

        // Header and padded data of a.txt, the big.bin header, then half of its data
        archive.truncate(512 + 512 + 512 + 50_000);

        let result = upload(builder(&bucket, "prefix"), archive, &progress).await;

        assert_matches!(result, Err(S3UnpackError::EntryAbandoned { path }) if path == "big.bin");
        assert!(bucket.object("prefix/big.bin").is_none());

        Ok(())
    })
}

#[test]
fn empty_archive_uploads_nothing() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let archive = archives::tar_archive(&[]);
        let outcome = upload(builder(&bucket, "prefix"), archive, &progress).await?;
        progress.sanity_check_updates();

        assert!(outcome.keys.is_empty());
        assert_eq!(0, outcome.total_entries);
        assert!(bucket.keys().is_empty());

        Ok(())
    })
}

/// The archive can be written to the sink in arbitrary pieces, including empty ones
#[test]
fn archive_written_in_random_chunks() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let one = archives::random_data(200_000);
        let two = archives::random_data(3_000);
        let archive = archives::tar_archive(&[
            ("one", None),
            ("one/one.bin", Some(one.as_slice())),
            ("one/two", None),
            ("one/two/two.bin", Some(two.as_slice())),
        ]);

        let mut sink = builder(&bucket, "test_prefix").build_with_progress(progress.clone())?;
        for chunk in archives::random_chunks(&archive, 10_000) {
            sink.write(chunk).await?;
        }
        let outcome = sink.finish().await?;
        progress.sanity_check_updates();

        assert_eq!(
            vec!["test_prefix/one/one.bin", "test_prefix/one/two/two.bin"],
            bucket.keys()
        );
        assert_eq!(&one[..], &bucket.object("test_prefix/one/one.bin").unwrap().data[..]);
        assert_eq!(
            &two[..],
            &bucket.object("test_prefix/one/two/two.bin").unwrap().data[..]
        );
        assert_eq!(203_000, outcome.total_bytes);
        assert_eq!(4, outcome.total_entries);

        Ok(())
    })
}

#[test]
fn zip_archive_is_unpacked() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let big = archives::random_data(300_000);
        let archive = archives::zip_archive(&[
            ("dir/", None),
            ("dir/a.txt", Some(&b"aaa"[..])),
            ("dir/big.bin", Some(big.as_slice())),
            ("b.txt", Some(&b"bb"[..])),
        ]);

        let mut builder = builder(&bucket, "zipped");
        builder.format(ArchiveFormat::Zip);

        let outcome = upload(builder, archive, &progress).await?;
        progress.sanity_check_updates();

        assert_eq!(
            vec!["zipped/b.txt", "zipped/dir/a.txt", "zipped/dir/big.bin"],
            bucket.keys()
        );
        assert_eq!(&big[..], &bucket.object("zipped/dir/big.bin").unwrap().data[..]);
        assert_eq!(4, outcome.total_entries);
        assert_eq!(
            vec![("dir/".to_string(), SkipReason::Directory)],
            progress.entries_skipped()
        );

        Ok(())
    })
}

/// Zip archives from streaming writers only record each entry's CRC and sizes in a data
/// descriptor after its data
#[test]
fn streamed_zip_archive_is_unpacked() -> Result<()> {
    test_with_logging(async move {
        let big = archives::random_data(300_000);

        for compress in [false, true] {
            let bucket = MemoryBucket::new("test");
            let progress = TestUploadProgressCallback::new();

            let archive = archives::streamed_zip_archive(
                &[
                    ("dir/", None),
                    ("dir/a.txt", Some(&b"aaa"[..])),
                    ("dir/big.bin", Some(big.as_slice())),
                    ("b.txt", Some(&b"bb"[..])),
                ],
                compress,
            );

            let mut builder = builder(&bucket, "zipped");
            builder.format(ArchiveFormat::Zip);

            let outcome = upload(builder, archive, &progress).await?;
            progress.sanity_check_updates();

            assert_eq!(
                vec!["zipped/b.txt", "zipped/dir/a.txt", "zipped/dir/big.bin"],
                bucket.keys()
            );
            let stored = bucket.object("zipped/dir/big.bin").unwrap();
            assert_eq!(&big[..], &stored.data[..]);
            assert_eq!(None, stored.size_hint);
            assert_eq!(&b"aaa"[..], &bucket.object("zipped/dir/a.txt").unwrap().data[..]);
            assert_eq!(4, outcome.total_entries);
            assert_eq!(300_005, outcome.total_bytes);
        }

        Ok(())
    })
}

#[test]
fn gzip_compressed_tar_is_unpacked() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();

        let tar = archives::tar_archive(&[
            ("a.txt", Some(&b"a"[..])),
            ("dir/b.txt", Some(&b"bb"[..])),
        ]);
        let tar_len = tar.len() as u64;

        let outcome = upload(builder(&bucket, "gz"), archives::gzip(&tar), &progress).await?;
        progress.sanity_check_updates();

        assert_eq!(vec!["gz/a.txt", "gz/dir/b.txt"], bucket.keys());
        // Counted after decompression
        assert_eq!(tar_len, outcome.archive_bytes);

        Ok(())
    })
}

#[test]
fn observer_annotates_objects() -> Result<()> {
    test_with_logging(async move {
        let bucket = MemoryBucket::new("test");
        let progress = TestUploadProgressCallback::new();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let archive = archives::tar_archive(&[
            ("dir/", None),
            ("dir/index.html", Some(&b"<html></html>"[..])),
            ("dir/data.dat", Some(&b"1234"[..])),
            ("dir/README", Some(&b"read me"[..])),
        ]);

        let mut builder = builder(&bucket, "web");
        {
            let observed = observed.clone();
            builder.on_entry(move |header, annotations| {
                observed
                    .lock()
                    .unwrap()
                    .push((header.name.clone(), header.kind));

                if header.name.ends_with(".dat") {
                    annotations.content_type = Some("application/x-test".to_string());
                    annotations.tagging = Some("source=archive".to_string());
                    annotations
                        .metadata
                        .insert("entry-size".to_string(), format!("{:?}", header.size));
                }
            });
        }

        upload(builder, archive, &progress).await?;
        progress.sanity_check_updates();

        // The observer sees every entry, in archive order, directories included
        assert_eq!(
            vec![
                ("dir/".to_string(), EntryKind::Directory),
                ("dir/index.html".to_string(), EntryKind::File),
                ("dir/data.dat".to_string(), EntryKind::File),
                ("dir/README".to_string(), EntryKind::File),
            ],
            *observed.lock().unwrap()
        );

        let html = bucket.object("web/dir/index.html").unwrap();
        assert_eq!(Some("text/html".to_string()), html.content_type);
        assert_eq!(None, html.tagging);
        assert!(html.metadata.is_empty());

        let data = bucket.object("web/dir/data.dat").unwrap();
        assert_eq!(Some("application/x-test".to_string()), data.content_type);
        assert_eq!(Some("source=archive".to_string()), data.tagging);
        assert_eq!(
            HashMap::from([("entry-size".to_string(), "Some(4)".to_string())]),
            data.metadata
        );

        let readme = bucket.object("web/dir/README").unwrap();
        assert_eq!(None, readme.content_type);

        Ok(())
    })
}

#[test]
fn zero_max_parallel_is_rejected() {
    let bucket = MemoryBucket::new("test");
    let mut builder = builder(&bucket, "prefix");
    builder.max_parallel(0);

    assert_matches!(
        builder.build(),
        Err(S3UnpackError::InvalidMaxParallel { max_parallel: 0 })
    );
}

#[test]
fn invalid_ignore_pattern_is_rejected() {
    let bucket = MemoryBucket::new("test");
    let mut builder = builder(&bucket, "prefix");

    assert_matches!(
        builder.add_ignore("(unclosed"),
        Err(S3UnpackError::InvalidIgnorePattern { pattern, .. }) if pattern == "(unclosed"
    );
}
