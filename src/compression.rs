//! Compression detection and (de)compression of layer diff streams.
//!
//! Diffs handed to [`apply_diff`](crate::Store::apply_diff) may arrive
//! compressed; the format is sniffed from the first bytes of the stream and
//! remembered in the layer's `diff-compression` flag so that
//! [`diff`](crate::Store::diff) can hand back a stream in the same format.

use std::io::{self, Cursor, Read};

use serde_json::Value;

use crate::util::read_up_to;

/// How much of a diff stream is examined to detect its compression.
pub(crate) const PEEK_SIZE: usize = 10240;

const BZIP2_MAGIC: &[u8] = b"BZh";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Compression format of a diff stream.
///
/// The discriminants are the values stored in the `diff-compression` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Uncompressed = 0,
    Bzip2 = 1,
    Gzip = 2,
    Xz = 3,
    Zstd = 4,
}

impl Compression {
    /// Identify the compression of a stream from its leading bytes.
    pub fn detect(source: &[u8]) -> Self {
        [
            (Self::Bzip2, BZIP2_MAGIC),
            (Self::Gzip, GZIP_MAGIC),
            (Self::Xz, XZ_MAGIC),
            (Self::Zstd, ZSTD_MAGIC),
        ]
        .into_iter()
        .find(|(_, magic)| source.starts_with(magic))
        .map_or(Self::Uncompressed, |(compression, _)| compression)
    }

    /// Interpret a stored `diff-compression` flag value.
    pub(crate) fn from_flag(value: &Value) -> Self {
        let value = value.as_u64().or_else(|| value.as_f64().map(|f| f as u64));
        match value {
            Some(1) => Self::Bzip2,
            Some(2) => Self::Gzip,
            Some(3) => Self::Xz,
            Some(4) => Self::Zstd,
            _ => Self::Uncompressed,
        }
    }

    pub(crate) fn flag_value(self) -> Value {
        Value::from(self as u64)
    }
}

/// Read the head of `reader` and detect its compression.
///
/// Returns the detected format together with a reader that yields the
/// complete stream, peeked bytes included.
pub(crate) fn peek<'a>(
    mut reader: impl Read + 'a,
) -> io::Result<(Compression, Box<dyn Read + 'a>)> {
    let mut head = vec![0u8; PEEK_SIZE];
    let n = read_up_to(&mut reader, &mut head)?;
    head.truncate(n);
    let compression = Compression::detect(&head);
    Ok((compression, Box::new(Cursor::new(head).chain(reader))))
}

/// Wrap `reader` so that it yields the decompressed stream.
pub(crate) fn decompress<'a>(
    compression: Compression,
    reader: impl Read + 'a,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::Uncompressed => Box::new(reader),
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
    })
}

/// Wrap `reader` so that it yields a compressed version of the stream.
pub(crate) fn compress<'a>(
    compression: Compression,
    reader: impl Read + 'a,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::Uncompressed => Box::new(reader),
        Compression::Bzip2 => Box::new(bzip2::read::BzEncoder::new(
            reader,
            bzip2::Compression::default(),
        )),
        Compression::Gzip => Box::new(flate2::read::GzEncoder::new(
            reader,
            flate2::Compression::default(),
        )),
        Compression::Xz => Box::new(xz2::read::XzEncoder::new(reader, 6)),
        Compression::Zstd => Box::new(zstd::stream::read::Encoder::new(reader, 0)?),
    })
}
