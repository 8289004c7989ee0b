// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;
use plexus_common::model::{EncodedValue, Language};

use crate::engine::FunctionValue;

#[derive(Debug, thiserror::Error)]
pub enum EncDecError {
    #[error("stream objects are handled separately, not as plain values")]
    StreamValue,
    #[error("undecodable {language} payload: {message}")]
    Undecodable { language: Language, message: String },
    #[error("cannot encode a structured value as {0}")]
    Unencodable(Language),
}

/// Decodes a stored object into the form the function engine consumes:
/// JSON payloads become structured values, interpreter-language payloads
/// stay opaque and are passed through to the engine untouched.
pub fn decode(value: &EncodedValue) -> Result<FunctionValue, EncDecError> {
    if value.is_stream {
        return Err(EncDecError::StreamValue);
    }
    match value.language {
        Language::Json => serde_json::from_slice(&value.data)
            .map(FunctionValue::Json)
            .map_err(|err| EncDecError::Undecodable {
                language: Language::Json,
                message: err.to_string(),
            }),
        _ => Ok(FunctionValue::Opaque(value.data.clone())),
    }
}

/// Encodes a function result for the object store. Structured values go
/// out as JSON (the cross-language path); opaque values keep the
/// function's declared language (the same-language fast path).
pub fn encode(
    value: FunctionValue,
    function_language: Language,
) -> Result<(Bytes, Language), EncDecError> {
    match value {
        FunctionValue::Json(json) => serde_json::to_vec(&json)
            .map(|data| (Bytes::from(data), Language::Json))
            .map_err(|err| EncDecError::Undecodable {
                language: Language::Json,
                message: err.to_string(),
            }),
        FunctionValue::Opaque(data) => match function_language {
            Language::Json => Err(EncDecError::Unencodable(Language::Json)),
            language => Ok((data, language)),
        },
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn json_payloads_decode_to_structured_values() {
        let value = EncodedValue::new(Language::Json, Bytes::from_static(b"[1,2,3]"));
        match decode(&value).unwrap() {
            FunctionValue::Json(json) => assert_eq!(json, serde_json::json!([1, 2, 3])),
            other => panic!("expected structured value, got {other:?}"),
        }
    }

    #[test]
    fn interpreter_payloads_stay_opaque() {
        let payload = Bytes::from_static(b"\x80\x05pickled");
        let value = EncodedValue::new(Language::Python, payload.clone());
        match decode(&value).unwrap() {
            FunctionValue::Opaque(data) => assert_eq!(data, payload),
            other => panic!("expected opaque value, got {other:?}"),
        }
    }

    #[test]
    fn structured_results_encode_as_json_regardless_of_function_language() {
        let (data, language) =
            encode(FunctionValue::Json(serde_json::json!({"n": 1})), Language::Python).unwrap();
        assert_eq!(language, Language::Json);
        assert_eq!(data, Bytes::from_static(b"{\"n\":1}"));
    }

    #[test]
    fn opaque_results_keep_the_function_language() {
        let payload = Bytes::from_static(b"\x80\x05result");
        let (data, language) =
            encode(FunctionValue::Opaque(payload.clone()), Language::Python).unwrap();
        assert_eq!(language, Language::Python);
        assert_eq!(data, payload);
    }

    #[test]
    fn stream_objects_are_rejected() {
        let mut value = EncodedValue::new(Language::Json, Bytes::from_static(b"[]"));
        value.is_stream = true;
        assert!(matches!(decode(&value), Err(EncDecError::StreamValue)));
    }
}
