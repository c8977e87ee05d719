//! Build small tar, zip and gzip archives in memory to feed to the code under test.
//!
//! Entry names are written exactly as given, without the cleanup the `tar` crate would normally
//! do to paths, so tests can exercise odd names like `one//one.txt`.
use rand::prelude::*;
use std::io::{Cursor, Write};

/// One entry of a test archive
#[derive(Clone, Debug)]
pub enum TestEntry<'a> {
    File { name: &'a str, data: &'a [u8] },
    Directory { name: &'a str },
    Symlink { name: &'a str, target: &'a str },
}

impl<'a> From<(&'a str, Option<&'a [u8]>)> for TestEntry<'a> {
    /// `(name, Some(data))` is a file, `(name, None)` a directory
    fn from((name, data): (&'a str, Option<&'a [u8]>)) -> Self {
        match data {
            Some(data) => Self::File { name, data },
            None => Self::Directory { name },
        }
    }
}

/// Build a tar archive of files and directories; see [`TestEntry`]'s `From` impl.
pub fn tar_archive(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
    let entries = entries
        .iter()
        .map(|entry| TestEntry::from(*entry))
        .collect::<Vec<_>>();

    tar_archive_with_entries(&entries)
}

pub fn tar_archive_with_entries(entries: &[TestEntry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);

        let (name, data): (&str, &[u8]) = match entry {
            TestEntry::File { name, data } => {
                header.set_entry_type(tar::EntryType::Regular);
                (*name, *data)
            }
            TestEntry::Directory { name } => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                (*name, b"".as_slice())
            }
            TestEntry::Symlink { name, target } => {
                header.set_entry_type(tar::EntryType::Symlink);
                header
                    .set_link_name(target)
                    .expect("symlink target is a valid tar link name");
                (*name, b"".as_slice())
            }
        };

        set_raw_name(&mut header, name);
        header.set_size(data.len() as u64);
        header.set_cksum();

        builder
            .append(&header, data)
            .expect("appending to an in-memory tar archive can't fail");
    }

    builder
        .into_inner()
        .expect("finishing an in-memory tar archive can't fail")
}

/// Put `name` in the header's name field byte for byte
fn set_raw_name(header: &mut tar::Header, name: &str) {
    let field = &mut header.as_old_mut().name;
    assert!(
        name.len() <= field.len(),
        "test entry name '{name}' is too long for a plain tar header"
    );

    field.fill(0);
    field[..name.len()].copy_from_slice(name.as_bytes());
}

/// Build a zip archive of files and directories.
///
/// Files are deflate-compressed, and their sizes are recorded in the local headers, which is what
/// a streaming zip reader needs.
pub fn zip_archive(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for (name, data) in entries {
        match data {
            Some(data) => {
                writer
                    .start_file(*name, options)
                    .expect("zip entry can be started");
                writer.write_all(data).expect("in-memory write can't fail");
            }
            None => {
                writer
                    .add_directory(*name, options)
                    .expect("zip directory can be added");
            }
        }
    }

    writer
        .finish()
        .expect("finishing an in-memory zip archive can't fail")
        .into_inner()
}

/// Build a zip archive the way streaming zip writers do: every local header has the data
/// descriptor flag set and zeroes for the CRC and sizes, which are only written in a signed data
/// descriptor after each entry's data.
///
/// Files are deflate-compressed if `compress` is set, and stored otherwise.  The central directory
/// is complete, so other zip readers can open the result too.
pub fn streamed_zip_archive(entries: &[(&str, Option<&[u8]>)], compress: bool) -> Vec<u8> {
    const DATA_DESCRIPTOR_FLAG: u16 = 1 << 3;

    let mut archive = Vec::new();
    let mut central_directory = Vec::new();

    for (name, data) in entries {
        let data = data.unwrap_or_default();
        let method: u16 = if compress && !name.ends_with('/') { 8 } else { 0 };
        let compressed = if method == 8 {
            let mut encoder =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).expect("in-memory write can't fail");
            encoder.finish().expect("in-memory write can't fail")
        } else {
            data.to_vec()
        };

        let mut crc = flate2::Crc::new();
        crc.update(data);

        let offset = archive.len() as u32;

        // Local header, with the CRC and sizes left for the descriptor
        archive.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        archive.extend_from_slice(&20u16.to_le_bytes());
        archive.extend_from_slice(&DATA_DESCRIPTOR_FLAG.to_le_bytes());
        archive.extend_from_slice(&method.to_le_bytes());
        archive.extend_from_slice(&[0u8; 4]);
        archive.extend_from_slice(&[0u8; 12]);
        archive.extend_from_slice(&(name.len() as u16).to_le_bytes());
        archive.extend_from_slice(&0u16.to_le_bytes());
        archive.extend_from_slice(name.as_bytes());

        archive.extend_from_slice(&compressed);

        archive.extend_from_slice(&0x0807_4b50u32.to_le_bytes());
        archive.extend_from_slice(&crc.sum().to_le_bytes());
        archive.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        archive.extend_from_slice(&(data.len() as u32).to_le_bytes());

        central_directory.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        central_directory.extend_from_slice(&20u16.to_le_bytes());
        central_directory.extend_from_slice(&20u16.to_le_bytes());
        central_directory.extend_from_slice(&DATA_DESCRIPTOR_FLAG.to_le_bytes());
        central_directory.extend_from_slice(&method.to_le_bytes());
        central_directory.extend_from_slice(&[0u8; 4]);
        central_directory.extend_from_slice(&crc.sum().to_le_bytes());
        central_directory.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        central_directory.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central_directory.extend_from_slice(&(name.len() as u16).to_le_bytes());
        // Extra field, comment, disk number, internal and external attributes
        central_directory.extend_from_slice(&[0u8; 12]);
        central_directory.extend_from_slice(&offset.to_le_bytes());
        central_directory.extend_from_slice(name.as_bytes());
    }

    let central_directory_offset = archive.len() as u32;
    archive.extend_from_slice(&central_directory);

    archive.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    archive.extend_from_slice(&[0u8; 4]);
    archive.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    archive.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    archive.extend_from_slice(&(central_directory.len() as u32).to_le_bytes());
    archive.extend_from_slice(&central_directory_offset.to_le_bytes());
    archive.extend_from_slice(&0u16.to_le_bytes());

    archive
}

/// Gzip-compress `data`
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).expect("in-memory write can't fail");
    encoder.finish().expect("in-memory write can't fail")
}

/// `len` bytes of random data, for entries whose contents don't matter beyond surviving the trip
pub fn random_data(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill(&mut data[..]);
    data
}

/// Split `data` into randomly-sized chunks, some of them empty, the way data arriving over a
/// network might be
pub fn random_chunks(data: &[u8], max_chunk_size: usize) -> Vec<Vec<u8>> {
    let mut rand = rand::thread_rng();
    let mut chunks = Vec::new();
    let mut remaining = data;

    while !remaining.is_empty() {
        let len = rand.gen_range(0..=max_chunk_size.max(1)).min(remaining.len());
        let (chunk, rest) = remaining.split_at(len);
        chunks.push(chunk.to_vec());
        remaining = rest;
    }

    chunks
}
