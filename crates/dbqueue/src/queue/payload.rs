use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

use crate::error::Result;

/// Converts between the stored text payload and the consumer's type.
pub trait PayloadTransformer<T>: Send + Sync {
    fn to_object(&self, payload: Option<&str>) -> Result<Option<T>>;

    fn from_object(&self, payload: Option<&T>) -> Result<Option<String>>;
}

/// Payload is stored and handed over as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringPayloadTransformer;

impl PayloadTransformer<String> for StringPayloadTransformer {
    fn to_object(&self, payload: Option<&str>) -> Result<Option<String>> {
        Ok(payload.map(str::to_string))
    }

    fn from_object(&self, payload: Option<&String>) -> Result<Option<String>> {
        Ok(payload.cloned())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JsonPayloadTransformer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonPayloadTransformer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonPayloadTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadTransformer<T> for JsonPayloadTransformer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn to_object(&self, payload: Option<&str>) -> Result<Option<T>> {
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn from_object(&self, payload: Option<&T>) -> Result<Option<String>> {
        match payload {
            Some(value) => Ok(Some(serde_json::to_string(value)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    #[test]
    fn json_transformer_reads_stored_text() {
        let t = JsonPayloadTransformer::<Email>::new();
        let parsed = t.to_object(Some(r#"{"to":"a@b.c"}"#)).unwrap();
        assert_eq!(parsed, Some(Email { to: "a@b.c".into() }));
        assert_eq!(t.to_object(None).unwrap(), None);
        assert!(t.to_object(Some("not json")).is_err());
    }

    #[test]
    fn string_transformer_is_identity() {
        let t = StringPayloadTransformer;
        assert_eq!(t.to_object(Some("x")).unwrap(), Some("x".to_string()));
        assert_eq!(t.from_object(Some(&"y".to_string())).unwrap(), Some("y".to_string()));
    }
}
