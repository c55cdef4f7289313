//! JsonCodec - リクエスト/結果と bytes の相互変換
//!
//! record と work item は bytes しか持たない。型との変換はここに集約する。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encoding or decoding failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json encode: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("json decode: {0}")]
    Decode(#[source] serde_json::Error),
}

/// serde_json based codec.
///
/// Encoding is deterministic for a given value, so a stored result replays
/// byte-for-byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Encode)
    }

    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::request::EchoRequest;
    use serde::ser::Error as _;

    #[test]
    fn json_codec_roundtrip() {
        let bytes = JsonCodec::encode(&EchoRequest { value: 7 }).unwrap();
        assert_eq!(bytes, br#"{"value":7}"#);

        let back: EchoRequest = JsonCodec::decode(&bytes).unwrap();
        assert_eq!(back, EchoRequest { value: 7 });
    }

    #[test]
    fn malformed_bytes_are_a_decode_error() {
        let err = JsonCodec::decode::<EchoRequest>(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refuses to serialize"))
        }
    }

    #[test]
    fn serializer_failure_is_an_encode_error() {
        let err = JsonCodec::encode(&Unencodable).unwrap_err();
        assert!(matches!(err, CodecError::Encode(_)));
        assert!(err.to_string().contains("refuses to serialize"));
    }
}
