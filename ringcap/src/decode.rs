use ringcap_common::{
    ContextHandle, Encoding, ParameterizedCapture, RawCapture, SkbFields, StructuredMeta,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("short sample: got {got} bytes, expected at least {expected}")]
    Short { got: usize, expected: usize },
}

/// An owned, decoded record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureRecord {
    Raw {
        handle: ContextHandle,
        payload: Vec<u8>,
    },
    Parameterized {
        handle: ContextHandle,
        payload: Vec<u8>,
    },
    Structured {
        handle: ContextHandle,
        #[serde(flatten)]
        fields: SkbFields,
    },
}

impl CaptureRecord {
    pub fn handle(&self) -> ContextHandle {
        match self {
            CaptureRecord::Raw { handle, .. }
            | CaptureRecord::Parameterized { handle, .. }
            | CaptureRecord::Structured { handle, .. } => *handle,
        }
    }
}

/// Interprets records according to the encoding the hook was attached with.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    encoding: Encoding,
}

impl Decoder {
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn short(&self, record: &[u8]) -> DecodeError {
        DecodeError::Short {
            got: record.len(),
            expected: self.encoding.record_len(),
        }
    }

    pub fn decode(&self, record: &[u8]) -> Result<CaptureRecord, DecodeError> {
        match self.encoding {
            Encoding::Raw => {
                let raw = RawCapture::decode(record).ok_or_else(|| self.short(record))?;
                Ok(CaptureRecord::Raw {
                    handle: raw.handle,
                    payload: raw.payload.to_vec(),
                })
            }
            Encoding::Parameterized { capture_size } => {
                let cap = ParameterizedCapture::decode(record, capture_size)
                    .ok_or_else(|| self.short(record))?;
                Ok(CaptureRecord::Parameterized {
                    handle: cap.handle,
                    payload: cap.payload.to_vec(),
                })
            }
            Encoding::Structured => {
                let meta = StructuredMeta::decode(record).ok_or_else(|| self.short(record))?;
                Ok(CaptureRecord::Structured {
                    handle: meta.handle,
                    fields: meta.fields,
                })
            }
        }
    }

    /// Sums every decoded value of the record without allocating: the handle
    /// plus each payload byte, or the handle plus every skb field.
    pub fn checksum(&self, record: &[u8]) -> Result<u64, DecodeError> {
        let sum = match self.encoding {
            Encoding::Raw => {
                let raw = RawCapture::decode(record).ok_or_else(|| self.short(record))?;
                raw.handle.as_raw().wrapping_add(byte_sum(raw.payload))
            }
            Encoding::Parameterized { capture_size } => {
                let cap = ParameterizedCapture::decode(record, capture_size)
                    .ok_or_else(|| self.short(record))?;
                cap.handle.as_raw().wrapping_add(byte_sum(cap.payload))
            }
            Encoding::Structured => {
                let meta = StructuredMeta::decode(record).ok_or_else(|| self.short(record))?;
                meta.fields
                    .scalars()
                    .iter()
                    .chain(meta.fields.cb.iter())
                    .fold(meta.handle.as_raw(), |acc, &v| acc.wrapping_add(u64::from(v)))
            }
        };
        Ok(sum)
    }
}

fn byte_sum(bytes: &[u8]) -> u64 {
    bytes.iter().map(|&b| u64::from(b)).sum()
}
