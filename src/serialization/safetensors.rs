//! `SafeTensors` format implementation.
//!
//! ```text
//! [8-byte header: u64 metadata length (little-endian)]
//! [JSON metadata: __metadata__, tensor names, dtypes, shapes, data_offsets]
//! [Raw tensor data: F32 values in little-endian]
//! ```
//!
//! Only F32 tensors are written or accepted. Files stay readable by the
//! `HuggingFace` `safetensors` loaders.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// Key of the free-form string map in the JSON header.
pub const METADATA_KEY: &str = "__metadata__";

/// Named tensors as `(row-major data, shape)`.
pub type TensorMap = BTreeMap<String, (Vec<f32>, Vec<usize>)>;

/// Metadata for a single tensor in `SafeTensors` format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMetadata {
    /// Data type of the tensor; always `"F32"` here.
    pub dtype: String,
    /// Shape of the tensor (e.g., `[n_features]` or `[rows, cols]`).
    pub shape: Vec<usize>,
    /// Data offsets `[start, end]` in the raw data section.
    pub data_offsets: [usize; 2],
}

/// Tensor entries of a header.
/// Uses `BTreeMap` for deterministic JSON serialization (sorted keys).
pub type SafeTensorsMetadata = BTreeMap<String, TensorMetadata>;

/// String map stored under `__metadata__`.
pub type UserMetadata = BTreeMap<String, String>;

/// Lays tensors out back to back and returns their header entries and the
/// raw data section.
#[must_use]
pub fn pack_tensors(tensors: &TensorMap) -> (SafeTensorsMetadata, Vec<u8>) {
    let mut metadata = SafeTensorsMetadata::new();
    let mut raw_data = Vec::with_capacity(tensors.values().map(|(d, _)| d.len() * 4).sum());

    for (name, (data, shape)) in tensors {
        let start_offset = raw_data.len();
        for &value in data {
            raw_data.extend_from_slice(&value.to_le_bytes());
        }
        metadata.insert(
            name.clone(),
            TensorMetadata {
                dtype: "F32".to_string(),
                shape: shape.clone(),
                data_offsets: [start_offset, raw_data.len()],
            },
        );
    }
    (metadata, raw_data)
}

/// Assembles a complete file image from header entries, user metadata and
/// the raw data section produced by [`pack_tensors`].
///
/// # Errors
///
/// Returns an error if the header cannot be serialized.
pub fn assemble(
    metadata: &SafeTensorsMetadata,
    user_metadata: &UserMetadata,
    raw_data: &[u8],
) -> Result<Vec<u8>> {
    let mut header = serde_json::Map::new();
    if !user_metadata.is_empty() {
        let meta_obj: serde_json::Map<String, serde_json::Value> = user_metadata
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        header.insert(METADATA_KEY.to_string(), serde_json::Value::Object(meta_obj));
    }
    for (name, meta) in metadata {
        header.insert(name.clone(), serde_json::to_value(meta)?);
    }

    let metadata_json = serde_json::to_string(&header)?;
    let metadata_bytes = metadata_json.as_bytes();
    let metadata_len = metadata_bytes.len() as u64;

    let mut output = Vec::with_capacity(8 + metadata_bytes.len() + raw_data.len());
    output.extend_from_slice(&metadata_len.to_le_bytes());
    output.extend_from_slice(metadata_bytes);
    output.extend_from_slice(raw_data);
    Ok(output)
}

/// Saves tensors with a `__metadata__` section.
///
/// # Errors
///
/// Returns an error if file writing or JSON serialization fails.
pub fn save_safetensors_with_metadata<P: AsRef<Path>>(
    path: P,
    tensors: &TensorMap,
    user_metadata: &UserMetadata,
) -> Result<()> {
    let (metadata, raw_data) = pack_tensors(tensors);
    let bytes = assemble(&metadata, user_metadata, &raw_data)?;
    fs::write(path, bytes)?;
    Ok(())
}

/// A parsed file image borrowing its raw data section.
#[derive(Debug)]
pub struct ParsedSafeTensors<'a> {
    /// Tensor entries.
    pub metadata: SafeTensorsMetadata,
    /// `__metadata__` strings.
    pub user_metadata: UserMetadata,
    /// Everything after the JSON header.
    pub raw_data: &'a [u8],
}

impl ParsedSafeTensors<'_> {
    /// Decodes every tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if any tensor entry is inconsistent with the data.
    pub fn tensors(&self) -> Result<TensorMap> {
        self.metadata
            .iter()
            .map(|(name, meta)| {
                let data = extract_tensor(name, self.raw_data, meta)?;
                Ok((name.clone(), (data, meta.shape.clone())))
            })
            .collect()
    }
}

/// Parses a file image.
///
/// # Errors
///
/// Returns [`WardenError::Format`] if:
/// - the header is shorter than 8 bytes or its length exceeds the file
/// - the JSON header is not an object or a tensor entry is malformed
pub fn parse(bytes: &[u8]) -> Result<ParsedSafeTensors<'_>> {
    let metadata_len = validate_and_read_header(bytes)?;
    let (metadata, user_metadata) = parse_metadata(&bytes[8..8 + metadata_len])?;
    Ok(ParsedSafeTensors {
        metadata,
        user_metadata,
        raw_data: &bytes[8 + metadata_len..],
    })
}

/// Loads all tensors and the `__metadata__` strings of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid `SafeTensors`.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<(TensorMap, UserMetadata)> {
    let bytes = fs::read(path)?;
    let parsed = parse(&bytes)?;
    let tensors = parsed.tensors()?;
    Ok((tensors, parsed.user_metadata))
}

fn validate_and_read_header(bytes: &[u8]) -> Result<usize> {
    let Some(header_bytes) = bytes.get(0..8) else {
        return Err(WardenError::Format(format!(
            "file is {} bytes, need at least 8 bytes for header",
            bytes.len()
        )));
    };
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(header_bytes);
    let metadata_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| WardenError::Format("metadata length does not fit in memory".into()))?;

    if metadata_len == 0 {
        return Err(WardenError::Format("metadata length is 0".into()));
    }
    if metadata_len > bytes.len() - 8 {
        return Err(WardenError::Format(format!(
            "metadata length {metadata_len} exceeds file size {}",
            bytes.len()
        )));
    }
    Ok(metadata_len)
}

fn parse_metadata(metadata_json: &[u8]) -> Result<(SafeTensorsMetadata, UserMetadata)> {
    let metadata_str = std::str::from_utf8(metadata_json)
        .map_err(|e| WardenError::Format(format!("metadata is not valid UTF-8: {e}")))?;
    let raw_metadata: serde_json::Value = serde_json::from_str(metadata_str)
        .map_err(|e| WardenError::Format(format!("header JSON parsing failed: {e}")))?;

    let serde_json::Value::Object(map) = raw_metadata else {
        return Err(WardenError::Format("header is not a JSON object".into()));
    };

    let mut metadata = SafeTensorsMetadata::new();
    let mut user_metadata = UserMetadata::new();
    for (key, value) in map {
        if key == METADATA_KEY {
            extract_user_metadata(value, &mut user_metadata)?;
            continue;
        }
        let tensor_meta = serde_json::from_value::<TensorMetadata>(value)
            .map_err(|e| WardenError::Format(format!("tensor '{key}': {e}")))?;
        metadata.insert(key, tensor_meta);
    }
    Ok((metadata, user_metadata))
}

fn extract_user_metadata(value: serde_json::Value, user_metadata: &mut UserMetadata) -> Result<()> {
    let serde_json::Value::Object(meta_map) = value else {
        return Err(WardenError::Format(format!("{METADATA_KEY} is not an object")));
    };
    for (mk, mv) in meta_map {
        let serde_json::Value::String(s) = mv else {
            return Err(WardenError::Format(format!(
                "{METADATA_KEY}.{mk} is not a string"
            )));
        };
        user_metadata.insert(mk, s);
    }
    Ok(())
}

/// Extracts one F32 tensor from the raw data section.
///
/// # Errors
///
/// Returns [`WardenError::Format`] if:
/// - the dtype is not F32
/// - data offsets are out of bounds or reversed
/// - the byte length does not match the shape
pub fn extract_tensor(name: &str, raw_data: &[u8], tensor_meta: &TensorMetadata) -> Result<Vec<f32>> {
    if tensor_meta.dtype != "F32" {
        return Err(WardenError::Format(format!(
            "tensor '{name}' has unsupported dtype {}; only F32 is supported",
            tensor_meta.dtype
        )));
    }
    let [start, end] = tensor_meta.data_offsets;
    if start > end || end > raw_data.len() {
        return Err(WardenError::Format(format!(
            "tensor '{name}' data offsets [{start}, {end}] out of bounds for {} bytes",
            raw_data.len()
        )));
    }
    let needed = tensor_meta
        .shape
        .iter()
        .try_fold(4_usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| {
            WardenError::Format(format!(
                "tensor '{name}' shape {:?} overflows the addressable size",
                tensor_meta.shape
            ))
        })?;
    if end - start != needed {
        return Err(WardenError::Format(format!(
            "tensor '{name}' has {} bytes, shape {:?} needs {needed}",
            end - start,
            tensor_meta.shape
        )));
    }

    Ok(raw_data[start..end]
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
