//! Content codec: body compression keyed by [`ContentEncoding`].

use super::errors::DecodeError;
use super::message::ContentEncoding;
use bytes::Bytes;
use std::io::{Read, Write};

const ZSTD_LEVEL: i32 = 3;

/// Compress `body` for the wire.
pub fn encode(body: &Bytes, encoding: ContentEncoding) -> Result<Bytes, DecodeError> {
    match encoding {
        ContentEncoding::Null => Ok(body.clone()),
        ContentEncoding::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(body)
                .and_then(|_| encoder.finish())
                .map(Bytes::from)
                .map_err(|e| compress_error("zlib", e))
        }
        ContentEncoding::Zstd => zstd::stream::encode_all(&body[..], ZSTD_LEVEL)
            .map(Bytes::from)
            .map_err(|e| compress_error("zstd", e)),
        ContentEncoding::Lz4 => Ok(Bytes::from(lz4_flex::compress_prepend_size(body))),
    }
}

/// Decompress a body received with `encoding`.
pub fn decode(body: &Bytes, encoding: ContentEncoding) -> Result<Bytes, DecodeError> {
    match encoding {
        ContentEncoding::Null => Ok(body.clone()),
        ContentEncoding::Zlib => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(&body[..])
                .read_to_end(&mut out)
                .map_err(|e| malformed("zlib", e))?;
            Ok(Bytes::from(out))
        }
        ContentEncoding::Zstd => zstd::stream::decode_all(&body[..])
            .map(Bytes::from)
            .map_err(|e| malformed("zstd", e)),
        ContentEncoding::Lz4 => lz4_flex::decompress_size_prepended(body)
            .map(Bytes::from)
            .map_err(|e| malformed("lz4", e)),
    }
}

fn malformed(encoding: &'static str, e: impl std::fmt::Display) -> DecodeError {
    DecodeError::Malformed {
        encoding,
        reason: e.to_string(),
    }
}

fn compress_error(encoding: &'static str, e: impl std::fmt::Display) -> DecodeError {
    DecodeError::Compress {
        encoding,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [ContentEncoding; 4] = [
        ContentEncoding::Null,
        ContentEncoding::Zlib,
        ContentEncoding::Zstd,
        ContentEncoding::Lz4,
    ];

    #[test]
    fn test_null_is_identity() {
        let body = Bytes::from_static(b"plain");
        assert_eq!(encode(&body, ContentEncoding::Null).unwrap(), body);
        assert_eq!(decode(&body, ContentEncoding::Null).unwrap(), body);
    }

    #[test]
    fn test_compression_shrinks_repetitive_bodies() {
        let body = Bytes::from(vec![b'a'; 64 * 1024]);
        for encoding in &ALL[1..] {
            let encoded = encode(&body, *encoding).unwrap();
            assert!(encoded.len() < body.len() / 10, "{encoding} did not compress");
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        let garbage = Bytes::from_static(b"\x00\x01definitely not compressed");
        for encoding in &ALL[1..] {
            let err = decode(&garbage, *encoding).unwrap_err();
            assert!(matches!(err, DecodeError::Malformed { .. }));
        }
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(body in prop::collection::vec(any::<u8>(), 0..4096), idx in 0usize..4) {
            let body = Bytes::from(body);
            let encoding = ALL[idx];
            let encoded = encode(&body, encoding).unwrap();
            prop_assert_eq!(decode(&encoded, encoding).unwrap(), body);
        }
    }
}
