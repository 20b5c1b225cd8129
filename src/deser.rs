use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::error::ConsumerError;

/// A pure `(topic, bytes) -> value` decoding function.
///
/// `payload` is `None` for tombstone records; most deserializers treat that as
/// an error, wrap them in [`OptionalDeserializer`] to map it to `None` instead.
pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, topic: &str, payload: Option<&[u8]>) -> Result<T, ConsumerError>;
}

/// Passes the raw bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDeserializer;

impl Deserializer<Vec<u8>> for BytesDeserializer {
    fn deserialize(&self, topic: &str, payload: Option<&[u8]>) -> Result<Vec<u8>, ConsumerError> {
        payload
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| empty_payload(topic))
    }
}

/// Decodes the payload as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDeserializer;

impl Deserializer<String> for StringDeserializer {
    fn deserialize(&self, topic: &str, payload: Option<&[u8]>) -> Result<String, ConsumerError> {
        let bytes = payload.ok_or_else(|| empty_payload(topic))?;
        String::from_utf8(bytes.to_vec()).map_err(|e| ConsumerError::Deserialization {
            topic: topic.to_string(),
            what: "utf-8 payload",
            reason: e.to_string(),
        })
    }
}

/// Decodes the payload as JSON via serde.
pub struct JsonDeserializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDeserializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deserializer<T> for JsonDeserializer<T>
where
    T: DeserializeOwned + Send + Sync,
{
    fn deserialize(&self, topic: &str, payload: Option<&[u8]>) -> Result<T, ConsumerError> {
        let bytes = payload.ok_or_else(|| empty_payload(topic))?;
        serde_json::from_slice(bytes).map_err(|e| ConsumerError::Deserialization {
            topic: topic.to_string(),
            what: "json payload",
            reason: e.to_string(),
        })
    }
}

/// Maps tombstones to `None` instead of failing the inner deserializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionalDeserializer<D>(pub D);

impl<T, D> Deserializer<Option<T>> for OptionalDeserializer<D>
where
    D: Deserializer<T>,
{
    fn deserialize(
        &self,
        topic: &str,
        payload: Option<&[u8]>,
    ) -> Result<Option<T>, ConsumerError> {
        match payload {
            None => Ok(None),
            Some(bytes) => self.0.deserialize(topic, Some(bytes)).map(Some),
        }
    }
}

fn empty_payload(topic: &str) -> ConsumerError {
    ConsumerError::Deserialization {
        topic: topic.to_string(),
        what: "payload",
        reason: "record has no payload".to_string(),
    }
}
