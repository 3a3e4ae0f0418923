use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use xrfcore::stream::block::StreamBlock;

/// Version of the counts payload layout; bump on any change of `CountsPayload`.
pub const PAYLOAD_VERSION: u8 = 1;

#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("bincode encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("bincode decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("json payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported payload version {found}, expected {expected}")]
    UnsupportedVersion { found: u8, expected: u8 },
}

/// Wire encoding of a payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// bincode with the standard config; the first byte of a frame is the payload version
    #[default]
    Bincode,
    Json,
}

/// Per-element counts of one completed scan of one detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct CountsPayload {
    pub version: u8,
    pub detector_id: u32,
    pub row: usize,
    pub col: usize,
    pub height: usize,
    pub width: usize,
    pub counts: BTreeMap<String, f64>,
}

impl CountsPayload {
    pub fn new(block: &StreamBlock, counts: BTreeMap<String, f64>) -> Self {
        CountsPayload {
            version: PAYLOAD_VERSION,
            detector_id: block.detector_id,
            row: block.row,
            col: block.col,
            height: block.height,
            width: block.width,
            counts,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CountsSerializer {
    format: PayloadFormat,
}

impl CountsSerializer {
    pub fn new(format: PayloadFormat) -> Self {
        CountsSerializer { format }
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn encode_counts(&self, block: &StreamBlock, counts: BTreeMap<String, f64>) -> Result<Vec<u8>, SerializeError> {
        self.encode(&CountsPayload::new(block, counts))
    }

    pub fn encode(&self, payload: &CountsPayload) -> Result<Vec<u8>, SerializeError> {
        match self.format {
            PayloadFormat::Bincode => Ok(bincode::encode_to_vec(payload, bincode::config::standard())?),
            PayloadFormat::Json => Ok(serde_json::to_vec(payload)?),
        }
    }
}

/// Subscriber side: decodes a counts frame and checks its version.
pub fn decode_counts(bytes: &[u8], format: PayloadFormat) -> Result<CountsPayload, SerializeError> {
    let payload: CountsPayload = match format {
        PayloadFormat::Bincode => bincode::decode_from_slice(bytes, bincode::config::standard())?.0,
        PayloadFormat::Json => serde_json::from_slice(bytes)?,
    };
    if payload.version != PAYLOAD_VERSION {
        return Err(SerializeError::UnsupportedVersion { found: payload.version, expected: PAYLOAD_VERSION });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use xrfcore::data::element::ElementSpecification;
    use xrfcore::data::spectrum::Spectrum;
    use xrfcore::fitting::parameters::{CalibratedModel, Calibration};
    use xrfcore::stream::block::FitContext;

    fn block() -> StreamBlock {
        let context = FitContext::new(
            Arc::new(CalibratedModel::from_calibration(Calibration::new(0.0, 0.01))),
            Arc::new(ElementSpecification::default_k_lines()),
        );
        StreamBlock::new(9, 19, 9, 19, 2, Spectrum::zeros(8), context)
    }

    fn counts() -> BTreeMap<String, f64> {
        BTreeMap::from([("Ca".to_string(), 12.5), ("Fe".to_string(), 1024.0)])
    }

    #[test]
    fn test_bincode_frame_starts_with_version() {
        let bytes = CountsSerializer::new(PayloadFormat::Bincode).encode_counts(&block(), counts()).unwrap();
        assert_eq!(bytes[0], PAYLOAD_VERSION);
        let payload = decode_counts(&bytes, PayloadFormat::Bincode).unwrap();
        assert_eq!(payload.detector_id, 2);
        assert_eq!((payload.height, payload.width), (9, 19));
        assert_eq!(payload.counts, counts());
    }

    #[test]
    fn test_json_payload_is_keyed_by_element() {
        let serializer = CountsSerializer::new(PayloadFormat::Json);
        assert_eq!(serializer.format(), PayloadFormat::Json);
        let bytes = serializer.encode_counts(&block(), counts()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["counts"]["Fe"], 1024.0);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut payload = CountsPayload::new(&block(), counts());
        payload.version = 7;
        let bytes = CountsSerializer::new(PayloadFormat::Bincode).encode(&payload).unwrap();
        assert!(matches!(
            decode_counts(&bytes, PayloadFormat::Bincode),
            Err(SerializeError::UnsupportedVersion { found: 7, expected: 1 })
        ));
    }
}
