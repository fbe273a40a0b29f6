//! Codec registry: named serializers and compressors.
//!
//! Application values travel through the registry as [`serde_json::Value`],
//! the common data model every serializer encodes from and decodes to.
//! Typed values are converted at the edges (`put`/`payload`).
//!
//! The registry is read on every publish and every decode, and written only
//! when an application registers a custom codec. Reads load an immutable
//! snapshot through [`ArcSwap`] and take no lock; writes are serialized by a
//! mutex and publish a new snapshot.
//!
//! # Default codecs
//!
//! | name   | kind       | content type          |
//! |--------|------------|-----------------------|
//! | `json` | serializer | `application/json`    |
//! | `yaml` | serializer | `application/x-yaml`  |
//! | `raw`  | serializer | `text/plain`, `application/data` |
//! | `zlib` | compressor | `application/x-gzip`  |
//! | `lz4`  | compressor | `application/x-lz4`   |

use crate::error::{CodecError, DecodeError};
use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// Name of the serializer used when none is requested
pub const DEFAULT_SERIALIZER: &str = "json";

/// Serialized payload plus the metadata needed to decode it again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub body: Bytes,
    pub content_type: String,
    pub content_encoding: String,
}

/// Fully encoded publish payload, after optional compression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub body: Bytes,
    pub content_type: String,
    pub content_encoding: String,
    /// Compressor content type, `None` when uncompressed
    pub compression: Option<String>,
}

/// A named value serializer
pub trait Serializer: Send + Sync {
    /// Primary content type written on messages encoded by this serializer
    fn content_type(&self) -> &str;

    /// Further content types this serializer can decode
    fn alternate_content_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// Encode a value
    fn encode(&self, value: &Value) -> Result<EncodedBody, CodecError>;

    /// Decode bytes that were written with `content_type`
    fn decode(&self, content_type: &str, data: &[u8]) -> Result<Value, CodecError>;
}

/// A named byte compressor
pub trait Compressor: Send + Sync {
    /// Content type recorded in the message's compression header
    fn content_type(&self) -> &str;

    fn compress(&self, data: &[u8]) -> Result<Bytes, CodecError>;

    fn decompress(&self, data: &[u8]) -> Result<Bytes, CodecError>;
}

// ============================================================================
// Default serializers
// ============================================================================

/// JSON serializer backed by `serde_json`
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn encode(&self, value: &Value) -> Result<EncodedBody, CodecError> {
        let body = serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            codec: "json".to_string(),
            reason: e.to_string(),
        })?;
        Ok(EncodedBody {
            body: Bytes::from(body),
            content_type: self.content_type().to_string(),
            content_encoding: "utf-8".to_string(),
        })
    }

    fn decode(&self, _content_type: &str, data: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode {
            codec: "json".to_string(),
            reason: e.to_string(),
        })
    }
}

/// YAML serializer backed by `serde_yaml`
pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn content_type(&self) -> &str {
        "application/x-yaml"
    }

    fn alternate_content_types(&self) -> Vec<String> {
        vec!["application/yaml".to_string()]
    }

    fn encode(&self, value: &Value) -> Result<EncodedBody, CodecError> {
        let text = serde_yaml::to_string(value).map_err(|e| CodecError::Encode {
            codec: "yaml".to_string(),
            reason: e.to_string(),
        })?;
        Ok(EncodedBody {
            body: Bytes::from(text),
            content_type: self.content_type().to_string(),
            content_encoding: "utf-8".to_string(),
        })
    }

    fn decode(&self, _content_type: &str, data: &[u8]) -> Result<Value, CodecError> {
        serde_yaml::from_slice(data).map_err(|e| CodecError::Decode {
            codec: "yaml".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Pass-through serializer.
///
/// Strings are sent as `text/plain`; arrays of byte values are sent as
/// opaque `application/data` and decoded back into byte arrays.
pub struct RawSerializer;

const TEXT_PLAIN: &str = "text/plain";
const BINARY_DATA: &str = "application/data";

impl Serializer for RawSerializer {
    fn content_type(&self) -> &str {
        BINARY_DATA
    }

    fn alternate_content_types(&self) -> Vec<String> {
        vec![TEXT_PLAIN.to_string()]
    }

    fn encode(&self, value: &Value) -> Result<EncodedBody, CodecError> {
        match value {
            Value::String(text) => Ok(EncodedBody {
                body: Bytes::from(text.clone()),
                content_type: TEXT_PLAIN.to_string(),
                content_encoding: "utf-8".to_string(),
            }),
            Value::Array(items) => {
                let bytes = items
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .filter(|b| *b <= u8::MAX as u64)
                            .map(|b| b as u8)
                    })
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(|| CodecError::Encode {
                        codec: "raw".to_string(),
                        reason: "arrays must contain only byte values".to_string(),
                    })?;
                Ok(EncodedBody {
                    body: Bytes::from(bytes),
                    content_type: BINARY_DATA.to_string(),
                    content_encoding: "binary".to_string(),
                })
            }
            _ => Err(CodecError::Encode {
                codec: "raw".to_string(),
                reason: "only strings and byte arrays can be sent raw".to_string(),
            }),
        }
    }

    fn decode(&self, content_type: &str, data: &[u8]) -> Result<Value, CodecError> {
        if content_type == TEXT_PLAIN {
            let text = std::str::from_utf8(data).map_err(|e| CodecError::Decode {
                codec: "raw".to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Value::String(text.to_string()));
        }
        Ok(Value::Array(data.iter().map(|b| Value::from(*b)).collect()))
    }
}

// ============================================================================
// Default compressors
// ============================================================================

/// zlib compression via `flate2`
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn content_type(&self) -> &str {
        "application/x-gzip"
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        let to_error = |e: std::io::Error| CodecError::Encode {
            codec: "zlib".to_string(),
            reason: e.to_string(),
        };
        encoder.write_all(data).map_err(to_error)?;
        encoder.finish().map(Bytes::from).map_err(to_error)
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        let mut decoder = flate2::read::ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decode {
                codec: "zlib".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Bytes::from(out))
    }
}

/// LZ4 block compression (size-prepended) via `lz4_flex`
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn content_type(&self) -> &str {
        "application/x-lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(data)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map(Bytes::from)
            .map_err(|e| CodecError::Decode {
                codec: "lz4".to_string(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone, Default)]
struct CodecTable {
    serializers: HashMap<String, Arc<dyn Serializer>>,
    serializer_by_type: HashMap<String, String>,
    compressors: HashMap<String, Arc<dyn Compressor>>,
    compressor_by_type: HashMap<String, String>,
}

/// Registry mapping codec names to serializers and compressors
pub struct CodecRegistry {
    table: ArcSwap<CodecTable>,
    write_lock: Mutex<()>,
}

impl CodecRegistry {
    /// Create a registry populated with the default codec set
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register_serializer("json", Arc::new(JsonSerializer));
        registry.register_serializer("yaml", Arc::new(YamlSerializer));
        registry.register_serializer("raw", Arc::new(RawSerializer));
        registry.register_compressor("zlib", Arc::new(ZlibCompressor));
        registry.register_compressor("lz4", Arc::new(Lz4Compressor));
        registry
    }

    /// Create a registry with no codecs at all
    pub fn empty() -> Self {
        Self {
            table: ArcSwap::from_pointee(CodecTable::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Register (or replace) a serializer under `name`
    pub fn register_serializer(&self, name: &str, serializer: Arc<dyn Serializer>) {
        let _guard = self.write_lock.lock();
        let mut table = CodecTable::clone(&self.table.load());

        table
            .serializer_by_type
            .insert(serializer.content_type().to_string(), name.to_string());
        for alternate in serializer.alternate_content_types() {
            table.serializer_by_type.insert(alternate, name.to_string());
        }
        table.serializers.insert(name.to_string(), serializer);

        self.table.store(Arc::new(table));
        tracing::debug!(serializer = name, "Registered serializer");
    }

    /// Register (or replace) a compressor under `name`
    pub fn register_compressor(&self, name: &str, compressor: Arc<dyn Compressor>) {
        let _guard = self.write_lock.lock();
        let mut table = CodecTable::clone(&self.table.load());

        table
            .compressor_by_type
            .insert(compressor.content_type().to_string(), name.to_string());
        table.compressors.insert(name.to_string(), compressor);

        self.table.store(Arc::new(table));
        tracing::debug!(compressor = name, "Registered compressor");
    }

    pub fn serializer(&self, name: &str) -> Result<Arc<dyn Serializer>, CodecError> {
        self.table
            .load()
            .serializers
            .get(name)
            .cloned()
            .ok_or_else(|| CodecError::UnknownSerializer {
                name: name.to_string(),
            })
    }

    /// Look up a compressor by name or by its content type
    pub fn compressor(&self, name_or_type: &str) -> Result<Arc<dyn Compressor>, CodecError> {
        let table = self.table.load();
        let name = table
            .compressor_by_type
            .get(name_or_type)
            .map(String::as_str)
            .unwrap_or(name_or_type);
        table
            .compressors
            .get(name)
            .cloned()
            .ok_or_else(|| CodecError::UnknownCompressor {
                name: name_or_type.to_string(),
            })
    }

    /// Find the serializer able to decode `content_type`
    pub fn serializer_for_content_type(
        &self,
        content_type: &str,
    ) -> Result<Arc<dyn Serializer>, CodecError> {
        let table = self.table.load();
        table
            .serializer_by_type
            .get(content_type)
            .and_then(|name| table.serializers.get(name))
            .cloned()
            .ok_or_else(|| CodecError::UnknownContentType {
                content_type: content_type.to_string(),
            })
    }

    /// Names of every registered serializer, sorted
    pub fn serializer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.load().serializers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of every registered compressor, sorted
    pub fn compressor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.load().compressors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Serialize `value` with the named serializer, then optionally compress
    pub fn encode(
        &self,
        value: &Value,
        serializer: &str,
        compression: Option<&str>,
    ) -> Result<EncodedPayload, CodecError> {
        let encoded = self.serializer(serializer)?.encode(value)?;

        let (body, compression) = match compression {
            Some(name) => {
                let compressor = self.compressor(name)?;
                (
                    compressor.compress(&encoded.body)?,
                    Some(compressor.content_type().to_string()),
                )
            }
            None => (encoded.body, None),
        };

        Ok(EncodedPayload {
            body,
            content_type: encoded.content_type,
            content_encoding: encoded.content_encoding,
            compression,
        })
    }

    /// Decompress (when a compression header is present) and deserialize
    pub fn decode(
        &self,
        body: &[u8],
        content_type: &str,
        compression: Option<&str>,
    ) -> Result<Value, DecodeError> {
        let decompressed;
        let data = match compression {
            Some(compression) => {
                let compressor =
                    self.compressor(compression)
                        .map_err(|_| DecodeError::UnsupportedCompression {
                            compression: compression.to_string(),
                        })?;
                decompressed =
                    compressor
                        .decompress(body)
                        .map_err(|e| DecodeError::Decompress {
                            compression: compression.to_string(),
                            message: e.to_string(),
                        })?;
                &decompressed[..]
            }
            None => body,
        };

        let serializer = self.serializer_for_content_type(content_type).map_err(|_| {
            DecodeError::UnsupportedContentType {
                content_type: content_type.to_string(),
            }
        })?;
        serializer
            .decode(content_type, data)
            .map_err(|e| DecodeError::Malformed {
                content_type: content_type.to_string(),
                message: e.to_string(),
            })
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("serializers", &self.serializer_names())
            .field("compressors", &self.compressor_names())
            .finish()
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
