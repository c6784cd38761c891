//! Pluggable typed-value encoding, modeled as a static trait-object table
//! rather than runtime reflection (see the "serializer plug-in" design
//! note). The `value_type` column stores each serializer's `tag`, so a
//! reader using a different serializer than the writer gets a
//! [`CacheError::DecodeError`] instead of silently misinterpreting bytes.

use crate::error::{CacheError, CacheResult};

/// Encodes/decodes a typed value to/from the opaque bytes stored in the
/// `value` column, and tags the encoding so mismatched reads are detectable.
pub trait Serializer<T>: Send + Sync {
    /// Short, stable tag written to `value_type` (e.g. `"binary"`, `"json"`).
    fn tag(&self) -> &'static str;

    fn encode(&self, value: &T) -> CacheResult<Vec<u8>>;

    /// Decodes `bytes`. `stored_tag` is the `value_type` actually read back
    /// from the row; implementations should reject a mismatch rather than
    /// attempt to decode bytes written by a different serializer.
    fn decode(&self, bytes: &[u8], stored_tag: Option<&str>) -> CacheResult<T>;
}

fn check_tag(expected: &'static str, stored_tag: Option<&str>) -> CacheResult<()> {
    match stored_tag {
        Some(tag) if tag == expected => Ok(()),
        Some(other) => Err(CacheError::DecodeError(format!(
            "value_type mismatch: expected {expected:?}, found {other:?}"
        ))),
        None => Err(CacheError::DecodeError(
            "value has no recorded value_type; cannot decode as typed value".to_string(),
        )),
    }
}

/// Passthrough serializer for raw bytes. Tag: `"binary"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinarySerializer;

impl Serializer<Vec<u8>> for BinarySerializer {
    fn tag(&self) -> &'static str {
        "binary"
    }

    fn encode(&self, value: &Vec<u8>) -> CacheResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8], stored_tag: Option<&str>) -> CacheResult<Vec<u8>> {
        check_tag(self.tag(), stored_tag)?;
        Ok(bytes.to_vec())
    }
}

/// JSON serializer built on `serde_json`. Tag: `"json"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl<T> Serializer<T> for JsonSerializer
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    fn tag(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &T) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::DecodeError(e.to_string()))
    }

    fn decode(&self, bytes: &[u8], stored_tag: Option<&str>) -> CacheResult<T> {
        check_tag(self.tag(), stored_tag)?;
        serde_json::from_slice(bytes).map_err(|e| CacheError::DecodeError(e.to_string()))
    }
}

/// A serializer built from caller-supplied encode/decode closures and an
/// arbitrary tag, for value types the built-ins don't cover.
pub struct CustomSerializer<T> {
    tag: &'static str,
    encode_fn: Box<dyn Fn(&T) -> CacheResult<Vec<u8>> + Send + Sync>,
    decode_fn: Box<dyn Fn(&[u8]) -> CacheResult<T> + Send + Sync>,
}

impl<T> CustomSerializer<T> {
    pub fn new(
        tag: &'static str,
        encode_fn: impl Fn(&T) -> CacheResult<Vec<u8>> + Send + Sync + 'static,
        decode_fn: impl Fn(&[u8]) -> CacheResult<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            tag,
            encode_fn: Box::new(encode_fn),
            decode_fn: Box::new(decode_fn),
        }
    }
}

impl<T: Send + Sync> Serializer<T> for CustomSerializer<T> {
    fn tag(&self) -> &'static str {
        self.tag
    }

    fn encode(&self, value: &T) -> CacheResult<Vec<u8>> {
        (self.encode_fn)(value)
    }

    fn decode(&self, bytes: &[u8], stored_tag: Option<&str>) -> CacheResult<T> {
        check_tag(self.tag, stored_tag)?;
        (self.decode_fn)(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[test]
    fn binary_round_trips() {
        let s = BinarySerializer;
        let original = vec![1u8, 2, 3, 4];
        let encoded = s.encode(&original).unwrap();
        let decoded = s.decode(&encoded, Some("binary")).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn binary_rejects_mismatched_tag() {
        let s = BinarySerializer;
        let encoded = s.encode(&vec![1u8]).unwrap();
        assert!(matches!(
            s.decode(&encoded, Some("json")),
            Err(CacheError::DecodeError(_))
        ));
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[test]
    fn json_round_trips() {
        let s = JsonSerializer;
        let original = Widget {
            name: "sprocket".into(),
            count: 7,
        };
        let encoded = Serializer::<Widget>::encode(&s, &original).unwrap();
        let decoded: Widget = s.decode(&encoded, Some("json")).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn json_rejects_missing_tag() {
        let s = JsonSerializer;
        let encoded = Serializer::<Widget>::encode(
            &s,
            &Widget {
                name: "x".into(),
                count: 1,
            },
        )
        .unwrap();
        let result: CacheResult<Widget> = s.decode(&encoded, None);
        assert!(result.is_err());
    }

    #[test]
    fn custom_serializer_uses_supplied_closures() {
        let s = CustomSerializer::new(
            "upper",
            |v: &String| Ok(v.to_uppercase().into_bytes()),
            |b: &[u8]| {
                Ok(String::from_utf8(b.to_vec())
                    .map_err(|e| CacheError::DecodeError(e.to_string()))?)
            },
        );
        let encoded = s.encode(&"hello".to_string()).unwrap();
        assert_eq!(encoded, b"HELLO");
        let decoded = s.decode(&encoded, Some("upper")).unwrap();
        assert_eq!(decoded, "HELLO");
    }
}
