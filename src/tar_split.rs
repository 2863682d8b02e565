//! Tar-split metadata: recording and replaying the exact structure of a tar stream.
//!
//! When a diff is applied to a layer, the uncompressed tar stream passes
//! through a [`TarSplitPacker`], which records every byte that is not file
//! content (headers, extension records, padding, the end-of-archive blocks)
//! together with the name, size and CRC64 of each file's content. The
//! recording is stored next to the layer as `<id>.tar-split.gz`.
//!
//! Later, [`assemble`] reproduces the original stream byte for byte from that
//! recording plus the file contents read back out of the layer.
//!
//! # Format
//!
//! The file is gzip-compressed NDJSON (one JSON object per line), the format
//! used by containers/storage:
//! - Type 1 (file): `{"type":1,"name":..,"size":..,"payload":<base64 CRC64>,"position":n}`
//! - Type 2 (segment): `{"type":2,"payload":<base64 bytes>,"position":n}`
//!
//! A member name that is not valid UTF-8 is stored base64-encoded as
//! `name_raw` instead of `name`. Checksums use the CRC64-ISO polynomial,
//! stored big-endian.

use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use base64::prelude::*;
use crc::{Crc, CRC_64_GO_ISO};
use flate2::{read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};

use crate::driver::FileGetter;
use crate::error::{Result, StorageError};
use crate::util::Digester;

/// Suffix of the per-layer tar-split file.
pub(crate) const TAR_SPLIT_SUFFIX: &str = ".tar-split.gz";

/// CRC64-ISO implementation for file checksums.
static CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

const BLOCK_SIZE: usize = 512;

/// One item of a tar-split recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TarSplitEntry {
    /// The content of one tar member.  `crc64` is absent for empty members.
    File {
        name: PathBuf,
        size: u64,
        crc64: Option<u64>,
    },
    /// Raw bytes of the stream that are reproduced verbatim.
    Segment(Vec<u8>),
}

/// Raw tar-split entry from NDJSON format before validation.
#[derive(Debug, Serialize, Deserialize)]
struct TarSplitEntryRaw {
    /// Entry type discriminant: 1 for File, 2 for Segment.
    #[serde(rename = "type")]
    type_id: u8,
    /// File name from TAR header (type 1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    /// Base64-encoded file name, when it is not valid UTF-8 (type 1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name_raw: Option<String>,
    /// File size in bytes (type 1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    /// Base64-encoded segment bytes, or the CRC64 of a file's content.
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    position: usize,
}

impl TarSplitEntry {
    /// Parse a tar-split entry from raw format with validation.
    fn from_raw(raw: TarSplitEntryRaw) -> Result<Self> {
        let payload = raw
            .payload
            .map(|payload| BASE64_STANDARD.decode(payload))
            .transpose()
            .map_err(|e| {
                StorageError::TarSplitError(format!("Failed to decode base64 payload: {e}"))
            })?;

        match raw.type_id {
            1 => {
                let crc64 = match payload {
                    None => None,
                    Some(bytes) => {
                        let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                            StorageError::TarSplitError(format!(
                                "Invalid CRC64 length: {} bytes",
                                bytes.len()
                            ))
                        })?;
                        Some(u64::from_be_bytes(bytes))
                    }
                };
                let name = match raw.name_raw {
                    Some(name_raw) => {
                        let bytes = BASE64_STANDARD.decode(name_raw).map_err(|e| {
                            StorageError::TarSplitError(format!(
                                "Failed to decode base64 name: {e}"
                            ))
                        })?;
                        PathBuf::from(OsString::from_vec(bytes))
                    }
                    None => PathBuf::from(raw.name.unwrap_or_default()),
                };
                Ok(TarSplitEntry::File {
                    name,
                    size: raw.size.unwrap_or(0),
                    crc64,
                })
            }
            2 => Ok(TarSplitEntry::Segment(payload.unwrap_or_default())),
            _ => Err(StorageError::TarSplitError(format!(
                "Invalid tar-split entry type: {}",
                raw.type_id
            ))),
        }
    }

    fn to_raw(&self, position: usize) -> TarSplitEntryRaw {
        match self {
            TarSplitEntry::File { name, size, crc64 } => TarSplitEntryRaw {
                type_id: 1,
                name: name.to_str().map(str::to_string),
                name_raw: name
                    .to_str()
                    .is_none()
                    .then(|| BASE64_STANDARD.encode(name.as_os_str().as_bytes())),
                size: (*size > 0).then_some(*size),
                payload: crc64.map(|crc| BASE64_STANDARD.encode(crc.to_be_bytes())),
                position,
            },
            TarSplitEntry::Segment(bytes) => TarSplitEntryRaw {
                type_id: 2,
                name: None,
                name_raw: None,
                size: None,
                payload: Some(BASE64_STANDARD.encode(bytes)),
                position,
            },
        }
    }
}

/// Serialize entries into the gzip'd NDJSON form.
pub(crate) fn encode(entries: &[TarSplitEntry]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    for (position, entry) in entries.iter().enumerate() {
        serde_json::to_writer(&mut encoder, &entry.to_raw(position))?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

/// Iterator over the entries of a gzip'd tar-split file.
#[derive(Debug)]
pub struct TarSplitReader<R: Read> {
    reader: BufReader<GzDecoder<R>>,
    /// Entry counter for error messages.
    entry_count: usize,
}

impl<R: Read> TarSplitReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(GzDecoder::new(reader)),
            entry_count: 0,
        }
    }

    fn read_entry(&mut self) -> Result<Option<TarSplitEntry>> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).map_err(|e| {
                StorageError::TarSplitError(format!("Failed to read tar-split line: {e}"))
            })?;
            if n == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            self.entry_count += 1;
            let raw: TarSplitEntryRaw = serde_json::from_str(&line).map_err(|e| {
                StorageError::TarSplitError(format!(
                    "Failed to parse tar-split entry {}: {e}",
                    self.entry_count
                ))
            })?;
            return TarSplitEntry::from_raw(raw).map(Some);
        }
    }
}

impl<R: Read> Iterator for TarSplitReader<R> {
    type Item = Result<TarSplitEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_entry().transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extension {
    GnuLongName,
    PaxLocal,
    Ignored,
}

enum State {
    /// Collecting a 512-byte header block.
    Header { filled: usize },
    /// Inside the data of a GNU or PAX extension record.
    Extension {
        kind: Extension,
        size: usize,
        remaining: u64,
    },
    /// Inside a member's content.
    Content {
        name: PathBuf,
        size: u64,
        remaining: u64,
        digest: crc::Digest<'static, u64>,
    },
    /// Inside the padding after a member's content.
    Padding { remaining: u64 },
    /// Past the end-of-archive marker.
    Trailer,
}

/// What a [`TarSplitPacker`] saw.
#[derive(Debug)]
pub(crate) struct Packed {
    pub(crate) entries: Vec<TarSplitEntry>,
    /// sha256 of the whole stream, as `sha256:<hex>`.
    pub(crate) digest: String,
    pub(crate) size: u64,
}

/// Pass-through reader that records the tar-split structure of the stream
/// read through it.
///
/// The stream is parsed incrementally as it goes by, so the consumer may
/// read in chunks of any size.  Members named by a GNU long name record or a
/// PAX `path` are recorded under the long name, and a PAX `size` overrides
/// the size in the member's header.
pub(crate) struct TarSplitPacker<R> {
    inner: R,
    state: State,
    block: [u8; BLOCK_SIZE],
    /// Raw bytes not yet emitted as a segment.
    segment: Vec<u8>,
    /// Data of the extension record being read.
    extension: Vec<u8>,
    long_name: Option<PathBuf>,
    pax_size: Option<u64>,
    entries: Vec<TarSplitEntry>,
    digester: Digester,
}

impl<R: Read> TarSplitPacker<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            state: State::Header { filled: 0 },
            block: [0; BLOCK_SIZE],
            segment: Vec::new(),
            extension: Vec::new(),
            long_name: None,
            pax_size: None,
            entries: Vec::new(),
            digester: Digester::default(),
        }
    }

    fn flush_segment(&mut self) {
        if !self.segment.is_empty() {
            let bytes = std::mem::take(&mut self.segment);
            self.entries.push(TarSplitEntry::Segment(bytes));
        }
    }

    fn feed(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let n = self.step(data)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Consume a prefix of `data`, returning its length.
    fn step(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            State::Header { filled } => {
                let n = (BLOCK_SIZE - *filled).min(data.len());
                self.block[*filled..*filled + n].copy_from_slice(&data[..n]);
                *filled += n;
                if *filled == BLOCK_SIZE {
                    self.end_of_header()?;
                }
                Ok(n)
            }
            State::Extension {
                kind,
                size,
                remaining,
            } => {
                let (kind, size) = (*kind, *size);
                let n = take(remaining, data.len());
                self.segment.extend_from_slice(&data[..n]);
                self.extension.extend_from_slice(&data[..n]);
                if *remaining == 0 {
                    self.end_of_extension(kind, size)?;
                }
                Ok(n)
            }
            State::Content {
                remaining, digest, ..
            } => {
                let n = take(remaining, data.len());
                digest.update(&data[..n]);
                if *remaining == 0 {
                    self.end_of_content();
                }
                Ok(n)
            }
            State::Padding { remaining } => {
                let n = take(remaining, data.len());
                self.segment.extend_from_slice(&data[..n]);
                if *remaining == 0 {
                    self.flush_segment();
                    self.state = State::Header { filled: 0 };
                }
                Ok(n)
            }
            State::Trailer => {
                self.segment.extend_from_slice(data);
                Ok(data.len())
            }
        }
    }

    fn end_of_header(&mut self) -> io::Result<()> {
        let block = self.block;
        self.segment.extend_from_slice(&block);
        self.state = State::Header { filled: 0 };

        if block == [0u8; BLOCK_SIZE] {
            self.state = State::Trailer;
            return Ok(());
        }

        let header = tar::Header::from_byte_slice(&block);
        let entry_type = header.entry_type();
        let size = header.entry_size()?;

        let extension = if entry_type.is_gnu_longname() {
            Some(Extension::GnuLongName)
        } else if entry_type.is_pax_local_extensions() {
            Some(Extension::PaxLocal)
        } else if entry_type.is_gnu_longlink() || entry_type.is_pax_global_extensions() {
            Some(Extension::Ignored)
        } else {
            None
        };
        if let Some(kind) = extension {
            let size = usize::try_from(size).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "oversized tar extension")
            })?;
            self.extension.clear();
            self.state = State::Extension {
                kind,
                size,
                remaining: (size as u64).next_multiple_of(BLOCK_SIZE as u64),
            };
            if size == 0 {
                self.end_of_extension(kind, 0)?;
            }
            return Ok(());
        }

        let name = match self.long_name.take() {
            Some(name) => name,
            None => path_from_bytes(&header.path_bytes()),
        };
        let size = self.pax_size.take().unwrap_or(size);
        self.flush_segment();

        let size = if is_header_only(entry_type) { 0 } else { size };
        if size == 0 {
            self.entries.push(TarSplitEntry::File {
                name,
                size: 0,
                crc64: None,
            });
        } else {
            self.state = State::Content {
                name,
                size,
                remaining: size,
                digest: CRC64_ISO.digest(),
            };
        }
        Ok(())
    }

    fn end_of_extension(&mut self, kind: Extension, size: usize) -> io::Result<()> {
        self.state = State::Header { filled: 0 };
        let data = &self.extension[..size.min(self.extension.len())];
        match kind {
            Extension::GnuLongName => {
                let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                self.long_name = Some(path_from_bytes(&data[..end]));
            }
            Extension::PaxLocal => {
                for extension in tar::PaxExtensions::new(data) {
                    let extension = extension?;
                    match extension.key() {
                        Ok("path") => {
                            self.long_name = Some(path_from_bytes(extension.value_bytes()));
                        }
                        Ok("size") => {
                            let size = extension
                                .value()
                                .ok()
                                .and_then(|value| value.parse::<u64>().ok())
                                .ok_or_else(|| {
                                    io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        "invalid PAX size record",
                                    )
                                })?;
                            self.pax_size = Some(size);
                        }
                        _ => {}
                    }
                }
            }
            Extension::Ignored => {}
        }
        Ok(())
    }

    fn end_of_content(&mut self) {
        let State::Content {
            name, size, digest, ..
        } = std::mem::replace(&mut self.state, State::Header { filled: 0 })
        else {
            return;
        };
        self.entries.push(TarSplitEntry::File {
            name,
            size,
            crc64: Some(digest.finalize()),
        });
        let padding = size.next_multiple_of(BLOCK_SIZE as u64) - size;
        if padding > 0 {
            self.state = State::Padding { remaining: padding };
        }
    }

    /// Stop recording and return the entries seen so far.
    ///
    /// Fails if the stream ended inside a member or extension record.
    pub(crate) fn finish(mut self) -> io::Result<Packed> {
        match self.state {
            State::Header { filled } => {
                let partial = self.block[..filled].to_vec();
                self.segment.extend_from_slice(&partial);
            }
            State::Padding { .. } | State::Trailer => {}
            State::Extension { .. } | State::Content { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "tar stream ended inside an entry",
                ));
            }
        }
        self.flush_segment();
        let (digest, size) = self.digester.finish();
        Ok(Packed {
            entries: self.entries,
            digest,
            size,
        })
    }
}

impl<R: Read> Read for TarSplitPacker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        self.feed(&buf[..n])?;
        Ok(n)
    }
}

/// Consume up to `available` bytes of the `remaining` count.
fn take(remaining: &mut u64, available: usize) -> usize {
    let n = (*remaining).min(available as u64) as usize;
    *remaining -= n as u64;
    n
}

fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(bytes))
}

/// Entry types whose size field does not describe data in the stream.
fn is_header_only(entry_type: tar::EntryType) -> bool {
    matches!(
        entry_type,
        tar::EntryType::Link
            | tar::EntryType::Symlink
            | tar::EntryType::Char
            | tar::EntryType::Block
            | tar::EntryType::Directory
            | tar::EntryType::Fifo
    )
}

/// Rebuild a tar stream from its tar-split entries, fetching file contents
/// through `getter`.  Every file's size and CRC64 is verified.
///
/// Returns the number of bytes written.
pub(crate) fn assemble(
    entries: impl IntoIterator<Item = Result<TarSplitEntry>>,
    getter: &dyn FileGetter,
    out: &mut impl Write,
) -> Result<u64> {
    let mut written = 0u64;
    for entry in entries {
        match entry? {
            TarSplitEntry::Segment(bytes) => {
                out.write_all(&bytes)?;
                written += bytes.len() as u64;
            }
            TarSplitEntry::File { size: 0, .. } => {}
            TarSplitEntry::File { name, size, crc64 } => {
                let mut file = getter.get(&name)?;
                copy_verified(&mut file, out, &name, size, crc64)?;
                written += size;
            }
        }
    }
    Ok(written)
}

/// Copy exactly `size` bytes, checking them against the recorded checksum.
fn copy_verified(
    file: &mut dyn Read,
    out: &mut impl Write,
    name: &Path,
    size: u64,
    expected: Option<u64>,
) -> Result<()> {
    let mut digest = CRC64_ISO.digest();
    let mut buffer = vec![0u8; 8192];
    let mut bytes_read = 0u64;
    let mut limited = file.take(size);

    loop {
        let n = match limited.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        digest.update(&buffer[..n]);
        out.write_all(&buffer[..n])?;
        bytes_read += n as u64;
    }

    // Verify size matches
    if bytes_read != size {
        return Err(StorageError::TarSplitError(format!(
            "File size mismatch for {}: expected {size}, got {bytes_read}",
            name.display()
        )));
    }

    let computed = digest.finalize();
    if let Some(expected) = expected.filter(|&expected| expected != computed) {
        return Err(StorageError::TarSplitError(format!(
            "CRC64 mismatch for {}: expected {expected:016x}, got {computed:016x}",
            name.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;

    use super::*;

    #[derive(Default)]
    struct MapGetter(HashMap<PathBuf, Vec<u8>>);

    impl FileGetter for MapGetter {
        fn get(&self, path: &Path) -> io::Result<Box<dyn Read>> {
            match self.0.get(path) {
                Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
                None => Err(io::ErrorKind::NotFound.into()),
            }
        }
    }

    fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, content: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_mtime(1234567890);
        header.set_size(content.len() as u64);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, content).unwrap();
    }

    fn sample_tar() -> (Vec<u8>, MapGetter) {
        let long_name = format!("deep/{}/file.txt", "x".repeat(120));
        let files = [
            ("hello.txt", b"Hello, World!".to_vec()),
            ("empty", vec![]),
            ("block.bin", vec![7u8; 1024]),
            (long_name.as_str(), b"long".to_vec()),
        ];

        let mut builder = tar::Builder::new(vec![]);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder.append_data(&mut header, "deep", &[][..]).unwrap();

        let mut getter = MapGetter::default();
        for (path, content) in &files {
            append_file(&mut builder, path, content);
            getter.0.insert(PathBuf::from(path), content.clone());
        }

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_link_name("hello.txt").unwrap();
        builder.append_data(&mut header, "link", &[][..]).unwrap();

        (builder.into_inner().unwrap(), getter)
    }

    fn pack(data: &[u8], chunk: usize) -> Packed {
        let mut packer = TarSplitPacker::new(data);
        let mut buf = vec![0u8; chunk];
        while packer.read(&mut buf).unwrap() != 0 {}
        packer.finish().unwrap()
    }

    #[test]
    fn test_pack_structure() {
        let (tar, _) = sample_tar();
        let packed = pack(&tar, 4096);

        let files: Vec<_> = packed
            .entries
            .iter()
            .filter_map(|entry| match entry {
                TarSplitEntry::File { name, size, crc64 } => {
                    Some((name.to_str().unwrap(), *size, *crc64))
                }
                TarSplitEntry::Segment(_) => None,
            })
            .collect();
        let long_name = format!("deep/{}/file.txt", "x".repeat(120));
        similar_asserts::assert_eq!(
            files,
            vec![
                ("deep", 0, None),
                ("hello.txt", 13, Some(CRC64_ISO.checksum(b"Hello, World!"))),
                ("empty", 0, None),
                ("block.bin", 1024, Some(CRC64_ISO.checksum(&[7u8; 1024]))),
                (long_name.as_str(), 4, Some(CRC64_ISO.checksum(b"long"))),
                ("link", 0, None),
            ]
        );

        // the header of the first member is its own segment
        assert!(matches!(&packed.entries[0], TarSplitEntry::Segment(b) if b.len() == BLOCK_SIZE));
        // the end-of-archive blocks are the final segment
        assert!(
            matches!(packed.entries.last(), Some(TarSplitEntry::Segment(b)) if b.iter().all(|&x| x == 0))
        );
        assert_eq!(packed.size, tar.len() as u64);
    }

    #[test]
    fn test_chunking_does_not_matter() {
        let (tar, _) = sample_tar();
        let whole = pack(&tar, tar.len());
        for chunk in [1, 7, 511, 513] {
            let packed = pack(&tar, chunk);
            assert_eq!(packed.entries, whole.entries, "chunk size {chunk}");
            assert_eq!(packed.digest, whole.digest);
        }
    }

    #[test]
    fn test_assemble_reproduces_stream() {
        let (tar, getter) = sample_tar();
        let packed = pack(&tar, 1000);

        let encoded = encode(&packed.entries).unwrap();
        let mut out = vec![];
        let written = assemble(TarSplitReader::new(&encoded[..]), &getter, &mut out).unwrap();
        assert_eq!(written, tar.len() as u64);
        assert!(out == tar, "reassembled stream differs");
    }

    #[test]
    fn test_assemble_detects_changed_content() {
        let (tar, mut getter) = sample_tar();
        let packed = pack(&tar, 1000);
        getter.0.insert("hello.txt".into(), b"Hello, Wurld!".to_vec());

        let err = assemble(packed.entries.into_iter().map(Ok), &getter, &mut io::sink());
        assert!(matches!(err, Err(StorageError::TarSplitError(msg)) if msg.contains("CRC64")));
    }

    #[test]
    fn test_truncated_stream() {
        let (tar, _) = sample_tar();
        // stop in the middle of hello.txt's content
        let mut packer = TarSplitPacker::new(&tar[..2 * BLOCK_SIZE + 5]);
        io::copy(&mut packer, &mut io::sink()).unwrap();
        assert_eq!(
            packer.finish().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_tar_split_entry_ndjson() {
        let entries = vec![
            TarSplitEntry::Segment(b"ustar\x0000".to_vec()),
            TarSplitEntry::File {
                name: "./etc/hosts".into(),
                size: 123,
                crc64: Some(0x0102030405060708),
            },
            TarSplitEntry::File {
                name: "./etc".into(),
                size: 0,
                crc64: None,
            },
            TarSplitEntry::File {
                name: path_from_bytes(b"caf\xe9"),
                size: 1,
                crc64: Some(1),
            },
        ];
        let encoded = encode(&entries).unwrap();

        let mut text = String::new();
        GzDecoder::new(&encoded[..]).read_to_string(&mut text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        similar_asserts::assert_eq!(
            lines,
            vec![
                r#"{"type":2,"payload":"dXN0YXIAMDA=","position":0}"#,
                r#"{"type":1,"name":"./etc/hosts","size":123,"payload":"AQIDBAUGBwg=","position":1}"#,
                r#"{"type":1,"name":"./etc","payload":null,"position":2}"#,
                r#"{"type":1,"name_raw":"Y2Fm6Q==","size":1,"payload":"AAAAAAAAAAE=","position":3}"#,
            ]
        );

        let decoded: Vec<_> = TarSplitReader::new(&encoded[..])
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_non_utf8_names() {
        let short = b"caf\xe9.txt".to_vec();
        let mut long = b"dir/".to_vec();
        long.extend(std::iter::repeat(b'x').take(120));
        long.extend(b"\xff.bin");

        let mut builder = tar::Builder::new(vec![]);
        let mut getter = MapGetter::default();
        for (name, content) in [(&short, &b"bytes"[..]), (&long, &b"long"[..])] {
            let name = path_from_bytes(name);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(content.len() as u64);
            builder.append_data(&mut header, &name, content).unwrap();
            getter.0.insert(name, content.to_vec());
        }
        let tar = builder.into_inner().unwrap();

        let packed = pack(&tar, 100);
        let names: Vec<_> = packed
            .entries
            .iter()
            .filter_map(|entry| match entry {
                TarSplitEntry::File { name, .. } => Some(name.as_os_str().as_bytes().to_vec()),
                TarSplitEntry::Segment(_) => None,
            })
            .collect();
        assert_eq!(names, vec![short, long]);

        let encoded = encode(&packed.entries).unwrap();
        let mut out = vec![];
        assemble(TarSplitReader::new(&encoded[..]), &getter, &mut out).unwrap();
        assert!(out == tar, "reassembled stream differs");
    }

    #[test]
    fn test_pax_size_overrides_header() {
        let content = b"hello";
        let record = b"10 size=5\n";

        let mut pax = tar::Header::new_ustar();
        pax.set_entry_type(tar::EntryType::XHeader);
        pax.set_path("PaxHeaders/big").unwrap();
        pax.set_mode(0o644);
        pax.set_size(record.len() as u64);
        pax.set_cksum();

        // the header itself claims no content
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_path("big").unwrap();
        header.set_mode(0o644);
        header.set_size(0);
        header.set_cksum();

        let mut builder = tar::Builder::new(vec![]);
        builder.append(&pax, &record[..]).unwrap();
        builder.append(&header, &content[..]).unwrap();
        let tar = builder.into_inner().unwrap();

        let packed = pack(&tar, 64);
        let files: Vec<_> = packed
            .entries
            .iter()
            .filter(|entry| matches!(entry, TarSplitEntry::File { .. }))
            .cloned()
            .collect();
        assert_eq!(
            files,
            vec![TarSplitEntry::File {
                name: "big".into(),
                size: 5,
                crc64: Some(CRC64_ISO.checksum(content)),
            }]
        );

        let mut getter = MapGetter::default();
        getter.0.insert("big".into(), content.to_vec());
        let mut out = vec![];
        assemble(packed.entries.into_iter().map(Ok), &getter, &mut out).unwrap();
        assert!(out == tar, "reassembled stream differs");
    }

    #[test]
    fn test_tar_split_entry_deserialization() {
        let raw: TarSplitEntryRaw = serde_json::from_str(r#"{"type":2}"#).unwrap();
        assert_eq!(
            TarSplitEntry::from_raw(raw).unwrap(),
            TarSplitEntry::Segment(vec![])
        );

        let raw: TarSplitEntryRaw =
            serde_json::from_str(r#"{"type":1,"name":"x","size":1,"payload":"AAAA"}"#).unwrap();
        assert!(TarSplitEntry::from_raw(raw).is_err());

        let raw: TarSplitEntryRaw =
            serde_json::from_str(r#"{"type":1,"name_raw":"/w==","payload":null}"#).unwrap();
        assert_eq!(
            TarSplitEntry::from_raw(raw).unwrap(),
            TarSplitEntry::File {
                name: path_from_bytes(b"\xff"),
                size: 0,
                crc64: None,
            }
        );

        // Test invalid type
        let raw: TarSplitEntryRaw = serde_json::from_str(r#"{"type":99}"#).unwrap();
        assert!(TarSplitEntry::from_raw(raw).is_err());
    }
}
