//! Reads entries from a zip stream by walking the local file headers in archive order.
//!
//! The central directory at the end of the archive is never consulted, so everything about an
//! entry has to come from its local header.  Streaming zip writers don't know an entry's CRC or
//! sizes when they write the local header; they set the data descriptor flag and write those
//! values in a descriptor record right after the data.  The end of such an entry's data is found
//! by the decompressor for deflated entries, and by scanning for a descriptor that matches the
//! data before it for stored entries.
//!
//! Reading stops at the first central directory record, and whatever follows is discarded by the
//! caller.
use super::{EntryEmitter, EntryHeader, EntryKind};
use crate::{Result, S3UnpackError};
use flate2::bufread::DeflateDecoder;
use flate2::Crc;
use std::io::{self, BufRead, Read};
use tracing::{debug, trace};

const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
const ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0606_4b50;
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;

/// Size of the fixed part of a local file header, up to the file name
const LOCAL_FILE_HEADER_SIZE: usize = 30;

const FLAG_ENCRYPTED: u16 = 1;
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

const ZIP64_EXTRA_FIELD: u16 = 0x0001;

/// How much raw input is read at a time
const READ_SIZE: usize = 64 * 1024;

pub(super) fn read_entries<R: Read>(reader: &mut R, emitter: &EntryEmitter) -> Result<usize> {
    let mut stream = ZipStream::new(reader);
    let mut count = 0;

    loop {
        match stream.peek_u32().map_err(zip_error)? {
            Some(LOCAL_FILE_HEADER_SIGNATURE) => {}
            Some(
                CENTRAL_DIRECTORY_SIGNATURE
                | ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE
                | END_OF_CENTRAL_DIRECTORY_SIGNATURE,
            ) => {
                trace!("Reached the central directory");
                break;
            }
            Some(signature) => {
                return Err(zip_error(invalid_data(format!(
                    "expected a local file header, found signature {signature:#010x}"
                ))));
            }
            None => {
                debug!("Zip stream ended without a central directory");
                break;
            }
        }

        let local = LocalHeader::read(&mut stream).map_err(zip_error)?;

        if local.flags & FLAG_ENCRYPTED != 0 {
            return crate::error::UnsupportedZipEntrySnafu {
                path: local.name,
                reason: "encrypted entries are not supported",
            }
            .fail();
        }

        if local.method != METHOD_STORED && local.method != METHOD_DEFLATED {
            return crate::error::UnsupportedZipEntrySnafu {
                path: local.name,
                reason: format!("compression method {} is not supported", local.method),
            }
            .fail();
        }

        let kind = if local.name.ends_with('/') {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        trace!(
            name = %local.name,
            method = local.method,
            data_descriptor = local.has_data_descriptor(),
            compressed_size = local.compressed_size,
            "Read zip local header"
        );

        let header = EntryHeader {
            name: local.name.clone(),
            kind,
            size: local.known_size(),
        };

        let mut data = EntryReader::new(&mut stream, &local);
        emitter.emit(header, &mut data)?;

        count += 1;
    }

    Ok(count)
}

fn zip_error(error: io::Error) -> S3UnpackError {
    super::read_error(error, |source| S3UnpackError::ZipRead { source })
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn truncated(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("zip stream ended in the middle of {what}"),
    )
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut le = [0u8; 8];
    le.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(le)
}

/// The parts of a local file header needed to read the entry's data
#[derive(Debug)]
struct LocalHeader {
    flags: u16,
    method: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    name: String,

    /// The header has a zip64 extra field, so a data descriptor has 64-bit sizes
    zip64: bool,
}

impl LocalHeader {
    fn read<R: Read>(stream: &mut ZipStream<R>) -> io::Result<Self> {
        let mut fixed = [0u8; LOCAL_FILE_HEADER_SIZE];
        read_exact(stream, &mut fixed, "a local file header")?;

        let flags = le_u16(&fixed[6..]);
        let method = le_u16(&fixed[8..]);
        let crc32 = le_u32(&fixed[14..]);
        let mut compressed_size = u64::from(le_u32(&fixed[18..]));
        let mut uncompressed_size = u64::from(le_u32(&fixed[22..]));
        let name_len = usize::from(le_u16(&fixed[26..]));
        let extra_len = usize::from(le_u16(&fixed[28..]));

        let mut name = vec![0u8; name_len];
        read_exact(stream, &mut name, "a file name")?;

        let mut extra = vec![0u8; extra_len];
        read_exact(stream, &mut extra, "an extra field")?;

        // Sizes that don't fit in 32 bits are in the zip64 extra field, in this order, and only
        // if the 32-bit field is saturated
        let mut zip64 = false;
        let mut fields = &extra[..];
        while fields.len() >= 4 {
            let id = le_u16(fields);
            let len = usize::from(le_u16(&fields[2..]));
            let Some(mut data) = fields.get(4..4 + len) else {
                break;
            };

            if id == ZIP64_EXTRA_FIELD {
                zip64 = true;

                if uncompressed_size == u64::from(u32::MAX) && data.len() >= 8 {
                    uncompressed_size = le_u64(data);
                    data = &data[8..];
                }
                if compressed_size == u64::from(u32::MAX) && data.len() >= 8 {
                    compressed_size = le_u64(data);
                }
            }

            fields = &fields[4 + len..];
        }

        Ok(Self {
            flags,
            method,
            crc32,
            compressed_size,
            uncompressed_size,
            // Names not flagged as UTF-8 are CP437, which agrees with UTF-8 on ASCII names
            name: String::from_utf8_lossy(&name).into_owned(),
            zip64,
        })
    }

    fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    /// The uncompressed size of the entry, unless it's only recorded after the data
    fn known_size(&self) -> Option<u64> {
        (!self.has_data_descriptor()).then_some(self.uncompressed_size)
    }
}

fn read_exact<R: Read>(stream: &mut ZipStream<R>, buf: &mut [u8], what: &str) -> io::Result<()> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => truncated(what),
        _ => e,
    })
}

/// The CRC and sizes from a data descriptor record
#[derive(Debug, PartialEq, Eq)]
struct DataDescriptor {
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
}

impl DataDescriptor {
    /// Size of a descriptor including its signature
    fn len(zip64: bool) -> usize {
        if zip64 {
            24
        } else {
            16
        }
    }

    /// Parse a descriptor, without its signature, from the start of `bytes`
    fn parse(bytes: &[u8], zip64: bool) -> Self {
        if zip64 {
            Self {
                crc32: le_u32(bytes),
                compressed_size: le_u64(&bytes[4..]),
                uncompressed_size: le_u64(&bytes[12..]),
            }
        } else {
            Self {
                crc32: le_u32(bytes),
                compressed_size: u64::from(le_u32(&bytes[4..])),
                uncompressed_size: u64::from(le_u32(&bytes[8..])),
            }
        }
    }

    /// Read the descriptor following the data of an entry.  The signature is optional.
    fn read<R: Read>(stream: &mut ZipStream<R>, zip64: bool) -> io::Result<Self> {
        if stream.peek_u32()? == Some(DATA_DESCRIPTOR_SIGNATURE) {
            stream.consume(4);
        }

        let mut bytes = [0u8; 20];
        let bytes = &mut bytes[..Self::len(zip64) - 4];
        read_exact(stream, bytes, "a data descriptor")?;

        Ok(Self::parse(bytes, zip64))
    }
}

/// Buffered reader over the raw zip stream, which can look ahead at bytes before consuming them
struct ZipStream<R> {
    inner: R,
    buffer: Vec<u8>,
    position: usize,
    eof: bool,
}

impl<R: Read> ZipStream<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(READ_SIZE),
            position: 0,
            eof: false,
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.buffer[self.position..]
    }

    /// Buffer at least `len` bytes, unless the input ends first.  Returns how many bytes are
    /// buffered.
    fn fill_to(&mut self, len: usize) -> io::Result<usize> {
        while self.buffered().len() < len && !self.eof {
            if self.position > 0 {
                self.buffer.drain(..self.position);
                self.position = 0;
            }

            let filled = self.buffer.len();
            self.buffer.resize(filled + READ_SIZE, 0);

            let result = loop {
                match self.inner.read(&mut self.buffer[filled..]) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    result => break result,
                }
            };

            let bytes_read = match result {
                Ok(bytes_read) => bytes_read,
                Err(e) => {
                    self.buffer.truncate(filled);
                    return Err(e);
                }
            };

            self.buffer.truncate(filled + bytes_read);
            if bytes_read == 0 {
                self.eof = true;
            }
        }

        Ok(self.buffered().len())
    }

    /// The next four bytes as a record signature, without consuming them.  `None` at the end of
    /// the input.
    fn peek_u32(&mut self) -> io::Result<Option<u32>> {
        match self.fill_to(4)? {
            0 => Ok(None),
            1..=3 => Err(truncated("a record signature")),
            _ => Ok(Some(le_u32(self.buffered()))),
        }
    }
}

impl<R: Read> Read for ZipStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);

        self.consume(len);

        Ok(len)
    }
}

impl<R: Read> BufRead for ZipStream<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.fill_to(1)?;

        Ok(self.buffered())
    }

    fn consume(&mut self, amt: usize) {
        self.position = (self.position + amt).min(self.buffer.len());

        if self.position == self.buffer.len() {
            self.buffer.clear();
            self.position = 0;
        }
    }
}

/// Where the data of an entry comes from, depending on how it's compressed and whether its
/// compressed size is known up front
enum EntryData<'s, R: Read> {
    Stored(io::Take<&'s mut ZipStream<R>>),
    Deflated(DeflateDecoder<io::Take<&'s mut ZipStream<R>>>),
    StoredUntilDescriptor(StoredUntilDescriptor<'s, R>),
    DeflatedUntilDescriptor(DeflateDecoder<&'s mut ZipStream<R>>),
}

/// Reads the uncompressed data of one entry and checks it against the CRC and size recorded for
/// it.  Reaching the end of the data also consumes the entry's data descriptor, if it has one,
/// leaving the stream at the next record.
///
/// A mismatch is reported as an error in place of the end of the data.
struct EntryReader<'s, R: Read> {
    data: EntryData<'s, R>,
    zip64: bool,

    /// CRC and size from the local header, unless the entry has a data descriptor
    expected: Option<(u32, u64)>,

    crc: Crc,
    size: u64,
    finished: bool,
}

impl<'s, R: Read> EntryReader<'s, R> {
    fn new(stream: &'s mut ZipStream<R>, local: &LocalHeader) -> Self {
        let data = match (local.method, local.has_data_descriptor()) {
            (METHOD_STORED, false) => EntryData::Stored(stream.take(local.compressed_size)),
            (METHOD_STORED, true) => {
                EntryData::StoredUntilDescriptor(StoredUntilDescriptor::new(stream, local.zip64))
            }
            (_, false) => {
                EntryData::Deflated(DeflateDecoder::new(stream.take(local.compressed_size)))
            }
            (_, true) => EntryData::DeflatedUntilDescriptor(DeflateDecoder::new(stream)),
        };

        Self {
            data,
            zip64: local.zip64,
            expected: (!local.has_data_descriptor())
                .then_some((local.crc32, local.uncompressed_size)),
            crc: Crc::new(),
            size: 0,
            finished: false,
        }
    }

    /// Called once the data has ended: consume whatever follows it and check what was read
    fn finish(&mut self) -> io::Result<()> {
        let expected = match &mut self.data {
            EntryData::Stored(data) => {
                if data.limit() > 0 {
                    return Err(truncated("the entry data"));
                }

                self.expected
            }
            EntryData::Deflated(decoder) => {
                // Anything left over after the end of the deflate stream is skipped
                let remaining = decoder.get_mut();
                io::copy(remaining, &mut io::sink())?;
                if remaining.limit() > 0 {
                    return Err(truncated("the entry data"));
                }

                self.expected
            }
            EntryData::StoredUntilDescriptor(_) => {
                // The end of the data was found by matching the descriptor against it
                None
            }
            EntryData::DeflatedUntilDescriptor(decoder) => {
                let compressed_size = decoder.total_in();
                let descriptor = DataDescriptor::read(&mut **decoder.get_mut(), self.zip64)?;

                if descriptor.compressed_size != compressed_size {
                    return Err(invalid_data(format!(
                        "data descriptor records {} compressed bytes but the entry has {compressed_size}",
                        descriptor.compressed_size
                    )));
                }

                Some((descriptor.crc32, descriptor.uncompressed_size))
            }
        };

        if let Some((crc32, size)) = expected {
            if size != self.size {
                return Err(invalid_data(format!(
                    "entry should have {size} bytes of data but has {}",
                    self.size
                )));
            }

            if crc32 != self.crc.sum() {
                return Err(invalid_data(format!(
                    "CRC mismatch: expected {crc32:#010x}, data has {:#010x}",
                    self.crc.sum()
                )));
            }
        }

        Ok(())
    }
}

impl<'s, R: Read> Read for EntryReader<'s, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }

        let bytes_read = match &mut self.data {
            EntryData::Stored(data) => data.read(buf)?,
            EntryData::Deflated(data) => data.read(buf)?,
            EntryData::StoredUntilDescriptor(data) => data.read(buf)?,
            EntryData::DeflatedUntilDescriptor(data) => data.read(buf)?,
        };

        if bytes_read > 0 {
            self.crc.update(&buf[..bytes_read]);
            self.size += bytes_read as u64;

            return Ok(bytes_read);
        }

        self.finished = true;
        self.finish()?;

        Ok(0)
    }
}

/// Stored data of unknown length, which ends at the first data descriptor whose CRC and sizes
/// match the data before it.
///
/// The last few bytes seen are always held back, since they could be the start of the
/// descriptor signature.
struct StoredUntilDescriptor<'s, R: Read> {
    stream: &'s mut ZipStream<R>,
    zip64: bool,
    crc: Crc,
    size: u64,
    done: bool,
}

impl<'s, R: Read> StoredUntilDescriptor<'s, R> {
    fn new(stream: &'s mut ZipStream<R>, zip64: bool) -> Self {
        Self {
            stream,
            zip64,
            crc: Crc::new(),
            size: 0,
            done: false,
        }
    }

    /// Whether a descriptor that ends the data starts at the beginning of `bytes`
    fn descriptor_matches(&self, bytes: &[u8]) -> bool {
        let descriptor = DataDescriptor::parse(&bytes[4..], self.zip64);

        descriptor
            == DataDescriptor {
                crc32: self.crc.sum(),
                compressed_size: self.size,
                uncompressed_size: self.size,
            }
    }
}

/// Offset of the first data descriptor signature in `bytes`
fn find_descriptor_signature(bytes: &[u8]) -> Option<usize> {
    let signature = DATA_DESCRIPTOR_SIGNATURE.to_le_bytes();

    bytes.windows(4).position(|window| window == signature)
}

impl<'s, R: Read> Read for StoredUntilDescriptor<'s, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }

        let descriptor_len = DataDescriptor::len(self.zip64);
        let available = self.stream.fill_to(descriptor_len)?;
        let buffered = self.stream.buffered();

        let releasable = match find_descriptor_signature(buffered) {
            Some(0) if available >= descriptor_len => {
                if self.descriptor_matches(buffered) {
                    self.stream.consume(descriptor_len);
                    self.done = true;

                    return Ok(0);
                }

                // Just data that happens to look like a signature
                find_descriptor_signature(&buffered[1..])
                    .map_or(buffered.len() - 3, |offset| offset + 1)
            }
            Some(0) => 0,
            Some(offset) => offset,
            None => buffered.len().saturating_sub(3),
        };

        if releasable == 0 {
            // Only possible once the input has ended without the descriptor
            return Err(truncated("the entry data"));
        }

        let len = releasable.min(buf.len());
        buf[..len].copy_from_slice(&buffered[..len]);
        self.crc.update(&buf[..len]);
        self.size += len as u64;
        self.stream.consume(len);

        Ok(len)
    }
}
