//! Detector persistence.
//!
//! Detectors are stored as `SafeTensors` files:
//! ```text
//! [8-byte header: u64 metadata length (little-endian)]
//! [JSON metadata: __metadata__ + tensor names, dtypes, shapes, data_offsets]
//! [Raw tensor data: F32 values in little-endian]
//! ```
//!
//! The `__metadata__` map always carries:
//!
//! | key              | value                                              |
//! |------------------|----------------------------------------------------|
//! | `format_version` | [`FORMAT_VERSION`]                                 |
//! | `detector_kind`  | `mahalanobis`, `spectral_signature`, `finetuning`  |
//! | `sha256`         | hex digest of the raw data section                 |
//! | `config`         | optional JSON of a [`crate::config::VersionedConfig`] |
//!
//! Any other key is a detector flag such as `relative`.
//!
//! # Example
//!
//! ```
//! use nalgebra::DVector;
//! use warden::detectors::DetectorKind;
//! use warden::serialization::DetectorFile;
//!
//! let mut file = DetectorFile::new(DetectorKind::SpectralSignature);
//! file.insert_vector("means.layer0", &DVector::from_vec(vec![1.0, 2.0]));
//!
//! let bytes = file.to_bytes().expect("serializable");
//! let loaded = DetectorFile::from_bytes(&bytes).expect("valid file");
//! assert_eq!(loaded.kind(), DetectorKind::SpectralSignature);
//! assert_eq!(loaded.vector("means.layer0").expect("present")[1], 2.0);
//! ```

pub mod safetensors;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use sha2::{Digest, Sha256};

use crate::config::VersionedConfig;
use crate::detectors::DetectorKind;
use crate::error::{Result, WardenError};
pub use safetensors::{TensorMap, UserMetadata};

/// Version written to and accepted from `__metadata__.format_version`.
pub const FORMAT_VERSION: &str = "1";

const KEY_FORMAT_VERSION: &str = "format_version";
const KEY_DETECTOR_KIND: &str = "detector_kind";
const KEY_SHA256: &str = "sha256";
const KEY_CONFIG: &str = "config";
const RESERVED_KEYS: [&str; 4] = [KEY_FORMAT_VERSION, KEY_DETECTOR_KIND, KEY_SHA256, KEY_CONFIG];

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// In-memory image of a detector file.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorFile {
    kind: DetectorKind,
    flags: BTreeMap<String, String>,
    config: Option<String>,
    tensors: TensorMap,
}

impl DetectorFile {
    /// Creates an empty file for `kind`.
    #[must_use]
    pub fn new(kind: DetectorKind) -> Self {
        Self {
            kind,
            flags: BTreeMap::new(),
            config: None,
            tensors: TensorMap::new(),
        }
    }

    /// Detector kind recorded in the header.
    #[must_use]
    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    /// Records a detector flag.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Format`] if `key` collides with a reserved key.
    pub fn set_flag(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        if RESERVED_KEYS.contains(&key) {
            return Err(WardenError::Format(format!("'{key}' is a reserved metadata key")));
        }
        self.flags.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Reads a detector flag.
    #[must_use]
    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }

    /// Reads a boolean flag; absent means `false`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Format`] if the value is not `true` or `false`.
    pub fn bool_flag(&self, key: &str) -> Result<bool> {
        match self.flag(key) {
            None | Some("false") => Ok(false),
            Some("true") => Ok(true),
            Some(other) => Err(WardenError::Format(format!(
                "flag '{key}' must be 'true' or 'false', got '{other}'"
            ))),
        }
    }

    /// Embeds the configuration the detector was trained with.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn set_config(&mut self, config: &VersionedConfig) -> Result<()> {
        self.config = Some(serde_json::to_string(config)?);
        Ok(())
    }

    /// Embedded configuration, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored JSON is invalid or has an unsupported
    /// schema version.
    pub fn config(&self) -> Result<Option<VersionedConfig>> {
        self.config
            .as_deref()
            .map(VersionedConfig::from_json)
            .transpose()
    }

    /// Stores a matrix (row-major, shape `[rows, cols]`) as F32.
    pub fn insert_matrix(&mut self, key: impl Into<String>, m: &DMatrix<f64>) {
        let data = (0..m.nrows())
            .flat_map(|i| (0..m.ncols()).map(move |j| m[(i, j)] as f32))
            .collect();
        self.tensors
            .insert(key.into(), (data, vec![m.nrows(), m.ncols()]));
    }

    /// Stores a vector (shape `[len]`) as F32.
    pub fn insert_vector(&mut self, key: impl Into<String>, v: &DVector<f64>) {
        let data = v.iter().map(|&x| x as f32).collect();
        self.tensors.insert(key.into(), (data, vec![v.len()]));
    }

    /// Stores a raw tensor.
    pub fn insert_tensor(&mut self, key: impl Into<String>, data: Vec<f32>, shape: Vec<usize>) {
        self.tensors.insert(key.into(), (data, shape));
    }

    /// Whether a tensor is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// Raw tensor lookup.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::MissingKey`] if absent.
    pub fn tensor(&self, key: &str) -> Result<&(Vec<f32>, Vec<usize>)> {
        self.tensors
            .get(key)
            .ok_or_else(|| WardenError::MissingKey(key.to_string()))
    }

    /// Reads a `[rows, cols]` tensor as a matrix.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::MissingKey`] if absent or
    /// [`WardenError::Format`] if the tensor is not 2D.
    pub fn matrix(&self, key: &str) -> Result<DMatrix<f64>> {
        let (data, shape) = self.tensor(key)?;
        let [rows, cols] = shape.as_slice() else {
            return Err(WardenError::Format(format!(
                "tensor '{key}' should be 2D, has shape {shape:?}"
            )));
        };
        let values: Vec<f64> = data.iter().map(|&x| f64::from(x)).collect();
        Ok(DMatrix::from_row_slice(*rows, *cols, &values))
    }

    /// Reads a `[len]` tensor as a vector.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::MissingKey`] if absent or
    /// [`WardenError::Format`] if the tensor is not 1D.
    pub fn vector(&self, key: &str) -> Result<DVector<f64>> {
        let (data, shape) = self.tensor(key)?;
        if shape.len() != 1 {
            return Err(WardenError::Format(format!(
                "tensor '{key}' should be 1D, has shape {shape:?}"
            )));
        }
        Ok(DVector::from_iterator(
            data.len(),
            data.iter().map(|&x| f64::from(x)),
        ))
    }

    /// Suffixes of every tensor key starting with `"{prefix}."`, sorted.
    #[must_use]
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = format!("{prefix}.");
        self.tensors
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Serializes to a `SafeTensors` image with the digest filled in.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let (metadata, raw_data) = safetensors::pack_tensors(&self.tensors);

        let mut user_metadata = self.flags.clone();
        user_metadata.insert(KEY_FORMAT_VERSION.into(), FORMAT_VERSION.into());
        user_metadata.insert(KEY_DETECTOR_KIND.into(), self.kind.as_str().into());
        user_metadata.insert(KEY_SHA256.into(), sha256_hex(&raw_data));
        if let Some(config) = &self.config {
            user_metadata.insert(KEY_CONFIG.into(), config.clone());
        }
        safetensors::assemble(&metadata, &user_metadata, &raw_data)
    }

    /// Parses and verifies a `SafeTensors` image.
    ///
    /// # Errors
    ///
    /// - [`WardenError::Format`] for a malformed file or unknown kind
    /// - [`WardenError::UnsupportedVersion`] for another `format_version`
    /// - [`WardenError::ChecksumMismatch`] if the data section was altered
    /// - [`WardenError::MissingKey`] if a required metadata key is absent
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let parsed = safetensors::parse(bytes)?;
        let mut user_metadata = parsed.user_metadata.clone();
        let kind = check_header(&user_metadata)?;

        let expected = user_metadata
            .remove(KEY_SHA256)
            .ok_or_else(|| WardenError::MissingKey(format!("__metadata__.{KEY_SHA256}")))?;
        let actual = sha256_hex(parsed.raw_data);
        if expected != actual {
            return Err(WardenError::ChecksumMismatch { expected, actual });
        }

        let tensors = parsed.tensors()?;
        user_metadata.remove(KEY_FORMAT_VERSION);
        user_metadata.remove(KEY_DETECTOR_KIND);
        let config = user_metadata.remove(KEY_CONFIG);
        Ok(Self {
            kind,
            flags: user_metadata,
            config,
            tensors,
        })
    }

    /// Writes the file to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Reads and verifies the file at `path`.
    ///
    /// # Errors
    ///
    /// See [`Self::from_bytes`]; I/O failures are [`WardenError::Io`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Fails unless this file holds a detector of kind `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Format`] on a kind mismatch.
    pub fn expect_kind(&self, expected: DetectorKind) -> Result<()> {
        if self.kind != expected {
            return Err(WardenError::Format(format!(
                "file holds a {} detector, expected {}",
                self.kind, expected
            )));
        }
        Ok(())
    }
}

fn check_header(user_metadata: &UserMetadata) -> Result<DetectorKind> {
    let version = user_metadata.get(KEY_FORMAT_VERSION).ok_or_else(|| {
        WardenError::MissingKey(format!("__metadata__.{KEY_FORMAT_VERSION}"))
    })?;
    if version != FORMAT_VERSION {
        return Err(WardenError::UnsupportedVersion {
            found: version.clone(),
            supported: FORMAT_VERSION.to_string(),
        });
    }
    user_metadata
        .get(KEY_DETECTOR_KIND)
        .ok_or_else(|| WardenError::MissingKey(format!("__metadata__.{KEY_DETECTOR_KIND}")))?
        .parse()
}

/// Reads only the header of a detector file and reports its kind, so
/// callers can pick the detector type before loading.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is malformed, or has an
/// unsupported version.
pub fn read_detector_kind<P: AsRef<Path>>(path: P) -> Result<DetectorKind> {
    let bytes = fs::read(path)?;
    let parsed = safetensors::parse(&bytes)?;
    check_header(&parsed.user_metadata)
}
