//! JSON payload codec.
//!
//! Converts between typed envelopes (`Envelope<Headers, M>`) and wire
//! envelopes whose payload is the JSON encoding of `M`. Headers are never
//! touched here; backends map them onto their own metadata format.

use serde::{Serialize, de::DeserializeOwned};
use tracing_error::SpanTrace;

use crate::{
    Envelope, Headers,
    transport::{RawPayload, ToBytes as _, WireEnvelope},
};

/// Encode the payload of `envelope` as JSON.
pub fn encode<M: Serialize>(envelope: &Envelope<Headers, M>) -> Result<WireEnvelope, CodecError> {
    let bytes = serde_json::to_vec(&envelope.message).map_err(CodecError::encode)?;
    Ok(Envelope {
        headers: envelope.headers.clone(),
        message: RawPayload(bytes),
    })
}

/// Decode the JSON payload of a wire envelope into `M`.
pub fn decode<M: DeserializeOwned>(envelope: &WireEnvelope) -> Result<Envelope<Headers, M>, CodecError> {
    let message = serde_json::from_slice(envelope.message.to_bytes()).map_err(CodecError::decode)?;
    Ok(Envelope {
        headers: envelope.headers.clone(),
        message,
    })
}

/// Error returned when a payload cannot be encoded or decoded.
#[derive(Debug)]
pub struct CodecError {
    context: SpanTrace,
    kind: CodecErrorKind,
}

/// Codec errors kind.
#[derive(Debug)]
pub enum CodecErrorKind {
    /// The payload could not be serialized.
    Encode(serde_json::Error),
    /// The payload is not valid JSON for the expected job type.
    Decode(serde_json::Error),
}

impl CodecError {
    fn encode(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CodecErrorKind::Encode(err),
        }
    }

    fn decode(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CodecErrorKind::Decode(err),
        }
    }

    pub fn kind(&self) -> &CodecErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CodecErrorKind::Encode(err) => writeln!(f, "Encode error: {err}"),
            CodecErrorKind::Decode(err) => writeln!(f, "Decode error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CodecErrorKind::Encode(err) | CodecErrorKind::Decode(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Refresh {
        id: u32,
    }

    #[test]
    fn payload_is_json_and_headers_are_kept() {
        let mut headers = Headers::new("apps", true);
        headers.attempt = 3;
        let envelope = Envelope {
            headers,
            message: Refresh { id: 440 },
        };

        let wire = encode(&envelope).unwrap();
        assert_eq!(wire.message, RawPayload::from(r#"{"id":440}"#));

        let back: Envelope<Headers, Refresh> = decode(&wire).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let wire = Envelope {
            headers: Headers::new("apps", false),
            message: RawPayload::from("not json"),
        };

        let err = decode::<Refresh>(&wire).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::Decode(_)));
    }
}
