//! Compression codecs (spec §1 "out of scope... invoked as black boxes"):
//! `QUANT`, `DIFF_SPARSE_QUANT`. The round kernels call [`Compression::decode`]
//! on the client's `updateModel` payload; this crate never implements the codecs
//! themselves.

use crate::error::CoreResult;

/// The `upload_compress_type`/`download_compress_type` hyper-param values
/// (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressType {
    NoCompress,
    Quant,
    DiffSparseQuant,
}

impl CompressType {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "QUANT" => Self::Quant,
            "DIFF_SPARSE_QUANT" => Self::DiffSparseQuant,
            _ => Self::NoCompress,
        }
    }
}

/// Black-box decoder a production binding supplies for the real codecs.
pub trait Compression: Clone + Send + Sync + 'static {
    /// Decodes `bytes` encoded as `compress_type` into a flat `f32` buffer
    /// matching the target weight's element count.
    fn decode(&self, compress_type: CompressType, bytes: &[u8], element_count: usize) -> CoreResult<Vec<f32>>;
}

/// Pass-through codec used by tests and by any deployment that disables
/// compression (`upload_compress_type = "NO_COMPRESS"`, the default in
/// [`crate::config::HyperParams`]).
#[derive(Debug, Clone, Default)]
pub struct IdentityCompression;

impl Compression for IdentityCompression {
    fn decode(&self, compress_type: CompressType, bytes: &[u8], element_count: usize) -> CoreResult<Vec<f32>> {
        if compress_type != CompressType::NoCompress {
            return Err(crate::error::CoreError::RequestError(
                "IdentityCompression cannot decode a real codec".to_string(),
            ));
        }
        let values = crate::model::bytes_as_f32(bytes)
            .ok_or_else(|| crate::error::CoreError::RequestError("malformed weight payload".to_string()))?;
        if values.len() != element_count {
            return Err(crate::error::CoreError::RequestError(format!(
                "expected {element_count} elements, got {}",
                values.len()
            )));
        }
        Ok(values.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::f32_vec_to_bytes;

    #[test]
    fn identity_round_trips_f32_bytes() {
        let codec = IdentityCompression;
        let bytes = f32_vec_to_bytes(&[1.0, 2.0, 3.0]);
        let out = codec.decode(CompressType::NoCompress, &bytes, 3).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn identity_rejects_real_codec() {
        let codec = IdentityCompression;
        let bytes = f32_vec_to_bytes(&[1.0]);
        assert!(codec.decode(CompressType::Quant, &bytes, 1).is_err());
    }

    #[test]
    fn identity_rejects_element_count_mismatch() {
        let codec = IdentityCompression;
        let bytes = f32_vec_to_bytes(&[1.0, 2.0]);
        assert!(codec.decode(CompressType::NoCompress, &bytes, 3).is_err());
    }
}
