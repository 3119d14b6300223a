//! Purpose: Element encodings for the queue layer.
//! Exports: `Codec`, `JsonCodec`, `StrCodec`, `BytesCodec`.
//! Role: Seam between typed elements and the raw payload bytes a queue
//! frames into its ring.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::error::{Error, ErrorKind};

/// Turns values into payload bytes and back. Implementations are cheap
/// unit structs; a queue holds one per instance.
pub trait Codec<T> {
    /// Appends the encoding of `value` to `buf`.
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), Error>;

    fn decode(&self, bytes: &[u8]) -> Result<T, Error>;
}

/// JSON payloads for any serde-representable element type.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), Error> {
        serde_json::to_writer(&mut *buf, value).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("element does not encode as JSON")
                .with_source(err)
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, Error> {
        serde_json::from_slice(bytes).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("stored element is not valid JSON")
                .with_source(err)
        })
    }
}

/// UTF-8 string payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct StrCodec;

impl Codec<String> for StrCodec {
    fn encode(&self, value: &String, buf: &mut Vec<u8>) -> Result<(), Error> {
        buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, Error> {
        String::from_utf8(bytes.to_vec()).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("stored element is not valid UTF-8")
                .with_source(err)
        })
    }
}

/// Identity: elements are already bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>, buf: &mut Vec<u8>) -> Result<(), Error> {
        buf.extend_from_slice(value);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::{BytesCodec, Codec, JsonCodec, StrCodec};
    use crate::core::error::ErrorKind;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
    struct Task {
        id: u32,
        name: String,
    }

    #[test]
    fn json_roundtrip() {
        let task = Task {
            id: 7,
            name: "reindex".to_string(),
        };
        let mut buf = Vec::new();
        JsonCodec.encode(&task, &mut buf).expect("encode");
        let back: Task = JsonCodec.decode(&buf).expect("decode");
        assert_eq!(back, task);
    }

    #[test]
    fn json_decode_rejects_garbage() {
        let err = <JsonCodec as Codec<Task>>::decode(&JsonCodec, b"{broken")
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn str_roundtrip_and_invalid_utf8() {
        let mut buf = Vec::new();
        StrCodec
            .encode(&"grüße".to_string(), &mut buf)
            .expect("encode");
        assert_eq!(StrCodec.decode(&buf).expect("decode"), "grüße");

        let err = StrCodec.decode(&[0xff, 0xfe]).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn bytes_roundtrip() {
        let payload = vec![0u8, 1, 2, 255];
        let mut buf = Vec::new();
        BytesCodec.encode(&payload, &mut buf).expect("encode");
        assert_eq!(BytesCodec.decode(&buf).expect("decode"), payload);
    }
}
