//! Payload codecs.

use std::fmt;
use std::marker::PhantomData;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts one payload type to and from bytes.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON codec backed by `serde_json`.
pub struct JsonCodec<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec")
            .field("payload", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).context("json encode")
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        if bytes.is_empty() {
            bail!("payload is empty");
        }
        serde_json::from_slice(bytes).context("json decode")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Signup {
        email: String,
        tags: Vec<String>,
        referrer: Option<String>,
    }

    #[test]
    fn test_json_codec_round_trip() {
        let codec = JsonCodec::<Signup>::new();
        let value = Signup {
            email: "a@example.org".into(),
            tags: vec!["beta".into(), "mn".into()],
            referrer: None,
        };

        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_json_codec_rejects_empty_bytes() {
        let codec = JsonCodec::<Signup>::new();
        let err = codec.decode(&[]).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_json_codec_rejects_wrong_shape() {
        let codec = JsonCodec::<Signup>::new();
        assert!(codec.decode(br#"{"email": 42}"#).is_err());
    }
}
