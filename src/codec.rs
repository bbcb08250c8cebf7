//! Built-in codec implementations.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{BackboneError, Result};
use crate::traits::Codec;

/// JSON codec backed by `serde_json`. The default for all stored envelopes.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(BackboneError::from)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(BackboneError::from)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
