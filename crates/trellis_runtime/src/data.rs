//! Port data and border codecs.
//!
//! Data moving between local ports is a type-erased `Arc`. Data crossing a
//! border is encoded into a self-describing envelope (type id plus body) so
//! the receiving side can decode it without knowing the producer's port
//! type.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::sync::Arc;

/// One item on a port
pub type Data = Arc<dyn Any + Send + Sync>;

/// Port type id matching any type
pub const ANY_TYPE: &str = "*";
/// Built-in type id for `bytes::Bytes`
pub const BYTES_TYPE: &str = "bytes";
/// Built-in type id for `i64`
pub const I64_TYPE: &str = "i64";
/// Built-in type id for `String`
pub const STRING_TYPE: &str = "string";
/// Built-in type id for `serde_json::Value`
pub const JSON_TYPE: &str = "json";

/// Wrap a value as port data
#[must_use]
pub fn data<T: Any + Send + Sync>(value: T) -> Data {
    Arc::new(value)
}

/// Codec error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// No codec registered under this type id
    #[error("Unknown data type: {type_id}")]
    UnknownType {
        /// Type id
        type_id: String,
    },
    /// No registered codec accepts the value
    #[error("No codec for value")]
    Unencodable,
    /// Encoding or decoding failed
    #[error("Codec {type_id} failed: {reason}")]
    Failed {
        /// Type id
        type_id: String,
        /// Reason
        reason: String,
    },
}

type EncodeFn = Arc<dyn Fn(&Data) -> Option<Result<Vec<u8>, String>> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Data, String> + Send + Sync>;

#[derive(Clone)]
struct Codec {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Type id to codec table
#[derive(Clone, Default)]
pub struct DataCodecs {
    codecs: IndexMap<String, Codec>,
}

impl DataCodecs {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with the built-in types registered
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut codecs = Self::new();
        codecs.register::<Bytes, _, _>(
            BYTES_TYPE,
            |v| Ok(v.to_vec()),
            |b| Ok(Bytes::copy_from_slice(b)),
        );
        codecs.register_serde::<i64>(I64_TYPE);
        codecs.register::<String, _, _>(
            STRING_TYPE,
            |v| Ok(v.as_bytes().to_vec()),
            |b| String::from_utf8(b.to_vec()).map_err(|e| e.to_string()),
        );
        codecs.register::<serde_json::Value, _, _>(
            JSON_TYPE,
            |v| serde_json::to_vec(v).map_err(|e| e.to_string()),
            |b| serde_json::from_slice(b).map_err(|e| e.to_string()),
        );
        codecs
    }

    /// Register a codec for `T`; a later registration of the same id wins
    pub fn register<T, E, D>(&mut self, type_id: &str, encode: E, decode: D)
    where
        T: Any + Send + Sync,
        E: Fn(&T) -> Result<Vec<u8>, String> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T, String> + Send + Sync + 'static,
    {
        let codec = Codec {
            encode: Arc::new(move |value: &Data| value.downcast_ref::<T>().map(&encode)),
            decode: Arc::new(move |bytes: &[u8]| decode(bytes).map(data)),
        };
        self.codecs.insert(type_id.to_string(), codec);
    }

    /// Register a postcard codec for a serde type
    pub fn register_serde<T>(&mut self, type_id: &str)
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        self.register::<T, _, _>(
            type_id,
            |v| postcard::to_allocvec(v).map_err(|e| e.to_string()),
            |b| postcard::from_bytes(b).map_err(|e| e.to_string()),
        );
    }

    /// Whether a type id is registered
    #[must_use]
    pub fn contains(&self, type_id: &str) -> bool {
        self.codecs.contains_key(type_id)
    }

    /// Type id of the first codec accepting `value`
    #[must_use]
    pub fn type_of(&self, value: &Data) -> Option<&str> {
        self.codecs
            .iter()
            .find(|(_, codec)| (codec.encode)(value).is_some())
            .map(|(id, _)| id.as_str())
    }

    /// Encode a value into an envelope
    ///
    /// # Errors
    ///
    /// Returns error if no codec accepts the value or encoding fails
    pub fn encode(&self, value: &Data) -> Result<Bytes, CodecError> {
        for (type_id, codec) in &self.codecs {
            if let Some(body) = (codec.encode)(value) {
                let body = body.map_err(|reason| CodecError::Failed {
                    type_id: type_id.clone(),
                    reason,
                })?;
                let envelope = postcard::to_allocvec(&(type_id.as_str(), body.as_slice()))
                    .map_err(|e| CodecError::Failed {
                        type_id: type_id.clone(),
                        reason: e.to_string(),
                    })?;
                return Ok(Bytes::from(envelope));
            }
        }
        Err(CodecError::Unencodable)
    }

    /// Decode an envelope
    ///
    /// # Errors
    ///
    /// Returns error if the envelope is malformed or names an unknown type
    pub fn decode(&self, envelope: &[u8]) -> Result<Data, CodecError> {
        let (type_id, body): (String, Vec<u8>) =
            postcard::from_bytes(envelope).map_err(|e| CodecError::Failed {
                type_id: "envelope".to_string(),
                reason: e.to_string(),
            })?;
        let codec = self
            .codecs
            .get(&type_id)
            .ok_or_else(|| CodecError::UnknownType {
                type_id: type_id.clone(),
            })?;
        (codec.decode)(&body).map_err(|reason| CodecError::Failed { type_id, reason })
    }
}

impl std::fmt::Debug for DataCodecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.codecs.keys()).finish()
    }
}
