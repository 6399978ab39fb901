//! Exchange payload compression
//!
//! The compressor used for a body is always identified by the encoding token the
//! sender put on the wire (`Content-Encoding`), so each direction can pick its
//! own encoding independently:
//! - `identity`: no-op, advertises no `Content-Encoding`
//! - `gzip`: used for requests and responses
//! - `deflate`: request bodies only, the server answers uncompressed

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::trace;

/// Compression errors
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("Failed to compress {encoding} payload: {source}")]
    Compress {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decompress {encoding} payload: {source}")]
    Decompress {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Decompressed {encoding} payload exceeds {limit} bytes")]
    TooLarge { encoding: &'static str, limit: usize },
}

/// Configured request compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Deflate,
}

/// Payload transform selected by encoding token
#[derive(Debug, PartialEq, Eq)]
pub enum Compressor {
    Identity,
    Gzip,
    Deflate,
}

static IDENTITY: Compressor = Compressor::Identity;
static GZIP: Compressor = Compressor::Gzip;
static DEFLATE: Compressor = Compressor::Deflate;

impl Compressor {
    /// Look up the compressor for an encoding token such as a `Content-Encoding`
    /// header value.
    ///
    /// Matching is case-insensitive and only the first listed token counts
    /// (`gzip;q=1.0, identity` resolves to gzip). Unknown or absent tokens
    /// resolve to identity. The same token always yields the same instance.
    pub fn for_encoding(encoding: Option<&str>) -> &'static Compressor {
        let token = encoding
            .and_then(|value| value.split(',').next())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_lowercase())
            .unwrap_or_default();

        match token.as_str() {
            "gzip" | "x-gzip" => &GZIP,
            "deflate" => &DEFLATE,
            _ => &IDENTITY,
        }
    }

    /// Compressor for a configured compression type
    pub fn for_type(compression: CompressionType) -> &'static Compressor {
        match compression {
            CompressionType::None => &IDENTITY,
            CompressionType::Gzip => &GZIP,
            CompressionType::Deflate => &DEFLATE,
        }
    }

    /// Token advertised in `Accept-Encoding`
    pub fn accept_encoding(&self) -> &'static str {
        match self {
            Compressor::Identity => "identity",
            Compressor::Gzip => "gzip",
            Compressor::Deflate => "deflate",
        }
    }

    /// Token written to `Content-Encoding`; `None` means "send as is"
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Compressor::Identity => None,
            Compressor::Gzip => Some("gzip"),
            Compressor::Deflate => Some("deflate"),
        }
    }

    /// Compressor the server applies to a response for a requester that
    /// advertised this one. Deflate stays request-only.
    pub fn response_compressor(&self) -> &'static Compressor {
        match self {
            Compressor::Gzip => &GZIP,
            Compressor::Identity | Compressor::Deflate => &IDENTITY,
        }
    }

    /// Encode `data`. Empty input and identity return the input unchanged.
    pub fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>, CompressError> {
        if data.is_empty() {
            return Ok(Cow::Borrowed(data));
        }

        let encoding = self.accept_encoding();
        let wrap = |source| CompressError::Compress { encoding, source };
        let compressed = match self {
            Compressor::Identity => return Ok(Cow::Borrowed(data)),
            Compressor::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).map_err(wrap)?;
                encoder.finish().map_err(wrap)?
            }
            Compressor::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).map_err(wrap)?;
                encoder.finish().map_err(wrap)?
            }
        };

        trace!(
            "compress: encoding={}, data.len={}, compressed.len={}",
            encoding,
            data.len(),
            compressed.len()
        );
        Ok(Cow::Owned(compressed))
    }

    /// Decode `data`. Empty input and identity return the input unchanged.
    pub fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>, CompressError> {
        self.decompress_limited(data, usize::MAX)
    }

    /// Decode `data`, failing once the decoded size would exceed `limit`
    pub fn decompress_limited<'a>(
        &self,
        data: &'a [u8],
        limit: usize,
    ) -> Result<Cow<'a, [u8]>, CompressError> {
        let encoding = self.accept_encoding();
        let too_large = || CompressError::TooLarge { encoding, limit };
        if data.is_empty() {
            return Ok(Cow::Borrowed(data));
        }
        if let Compressor::Identity = self {
            return if data.len() > limit {
                Err(too_large())
            } else {
                Ok(Cow::Borrowed(data))
            };
        }

        let cap = (limit as u64).saturating_add(1);
        let mut decompressed = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
        let result = match self {
            Compressor::Gzip => GzDecoder::new(data).take(cap).read_to_end(&mut decompressed),
            Compressor::Deflate => ZlibDecoder::new(data).take(cap).read_to_end(&mut decompressed),
            Compressor::Identity => Ok(0),
        };
        result.map_err(|source| CompressError::Decompress { encoding, source })?;
        if decompressed.len() > limit {
            return Err(too_large());
        }

        trace!(
            "decompress: encoding={}, data.len={}, decompressed.len={}",
            encoding,
            data.len(),
            decompressed.len()
        );
        Ok(Cow::Owned(decompressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [&Compressor; 3] = [
        &Compressor::Identity,
        &Compressor::Gzip,
        &Compressor::Deflate,
    ];

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip() {
        for compressor in ALL {
            for len in [1, 100, 65_536, 200_000] {
                let data = sample(len);
                let compressed = compressor.compress(&data).unwrap();
                let restored = compressor.decompress(&compressed).unwrap();
                assert_eq!(restored.as_ref(), data.as_slice(), "{:?}", compressor);
            }
        }
    }

    #[test]
    fn test_empty_payload_is_noop() {
        for compressor in ALL {
            let compressed = compressor.compress(&[]).unwrap();
            assert!(matches!(compressed, Cow::Borrowed(b) if b.is_empty()));
            let decompressed = compressor.decompress(&[]).unwrap();
            assert!(matches!(decompressed, Cow::Borrowed(b) if b.is_empty()));
        }
    }

    #[test]
    fn test_decompress_limit() {
        let data = vec![0u8; 10_000];
        for compressor in ALL {
            let compressed = compressor.compress(&data).unwrap();
            let restored = compressor.decompress_limited(&compressed, 10_000).unwrap();
            assert_eq!(restored.len(), 10_000);
            assert!(matches!(
                compressor.decompress_limited(&compressed, 9_999),
                Err(CompressError::TooLarge { limit: 9_999, .. })
            ));
        }
    }

    #[test]
    fn test_identity_borrows_input() {
        let data = sample(64);
        assert!(matches!(IDENTITY.compress(&data).unwrap(), Cow::Borrowed(_)));
        assert!(matches!(IDENTITY.decompress(&data).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_lookup_returns_cached_instances() {
        assert!(std::ptr::eq(
            Compressor::for_encoding(Some("gzip")),
            Compressor::for_encoding(Some("GZIP"))
        ));
        assert!(std::ptr::eq(
            Compressor::for_encoding(Some("deflate")),
            Compressor::for_type(CompressionType::Deflate)
        ));
        assert_eq!(*Compressor::for_encoding(Some("gzip;q=1.0, br")), Compressor::Gzip);
        assert_eq!(*Compressor::for_encoding(Some("br")), Compressor::Identity);
        assert_eq!(*Compressor::for_encoding(None), Compressor::Identity);
    }

    #[test]
    fn test_tokens() {
        assert_eq!(IDENTITY.content_encoding(), None);
        assert_eq!(IDENTITY.accept_encoding(), "identity");
        assert_eq!(GZIP.content_encoding(), Some("gzip"));
        assert_eq!(DEFLATE.content_encoding(), Some("deflate"));
    }

    #[test]
    fn test_deflate_is_request_only() {
        assert_eq!(*DEFLATE.response_compressor(), Compressor::Identity);
        assert_eq!(*GZIP.response_compressor(), Compressor::Gzip);
        assert_eq!(*IDENTITY.response_compressor(), Compressor::Identity);
    }

    #[test]
    fn test_corrupted_payload_fails() {
        let garbage = b"definitely not compressed";
        assert!(matches!(
            GZIP.decompress(garbage),
            Err(CompressError::Decompress { encoding: "gzip", .. })
        ));
        assert!(DEFLATE.decompress(garbage).is_err());
    }
}
