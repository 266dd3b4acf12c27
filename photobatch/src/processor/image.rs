//! Images, operations and content fingerprints.

use super::error::ProcessingError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Image
// =============================================================================

/// An in-memory image.
///
/// The pixel payload is opaque to the engine and shared behind an `Arc`, so
/// clones are cheap. `content_id` identifies the content for caching: two
/// images with the same id are treated as identical.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    content_id: String,
    data: Arc<Vec<u8>>,
}

impl Image {
    /// Creates an image with an explicit content identity.
    pub fn new(content_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            content_id: content_id.into(),
            data: Arc::new(data),
        }
    }

    /// Creates an image whose identity is the SHA-256 of its bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let content_id = hex(&Sha256::digest(&data));
        Self::new(content_id, data)
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("content_id", &self.content_id)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// =============================================================================
// Operation
// =============================================================================

/// One step of an operation pipeline, e.g. `resize {width: 800}`.
///
/// Parameters are kept in a `BTreeMap` so serialization, and therefore the
/// fingerprint, does not depend on insertion order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Fingerprint
// =============================================================================

/// Cache key: SHA-256 over the content identity and the serialized pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn compute(image: &Image, operations: &[Operation]) -> Result<Self, ProcessingError> {
        let pipeline = serde_json::to_vec(operations)
            .map_err(|e| ProcessingError::Serialization(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update((image.content_id.len() as u64).to_le_bytes());
        hasher.update(image.content_id.as_bytes());
        hasher.update(&pipeline);
        Ok(Self(hasher.finalize().into()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &hex(&self.0)[..12])
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_identity_is_content_hash() {
        let a = Image::from_bytes(vec![1, 2, 3]);
        let b = Image::from_bytes(vec![1, 2, 3]);
        let c = Image::from_bytes(vec![3, 2, 1]);
        assert_eq!(a.content_id(), b.content_id());
        assert_ne!(a.content_id(), c.content_id());
        assert_eq!(a.content_id().len(), 64);
    }

    #[test]
    fn test_fingerprint_depends_on_image_and_pipeline() {
        let image = Image::new("img-1", vec![0; 4]);
        let other = Image::new("img-2", vec![0; 4]);
        let ops = vec![Operation::new("resize").with_param("width", 800)];
        let more = vec![
            Operation::new("resize").with_param("width", 800),
            Operation::new("sharpen"),
        ];

        let base = Fingerprint::compute(&image, &ops).unwrap();
        assert_eq!(base, Fingerprint::compute(&image, &ops).unwrap());
        assert_ne!(base, Fingerprint::compute(&other, &ops).unwrap());
        assert_ne!(base, Fingerprint::compute(&image, &more).unwrap());
        assert_ne!(base, Fingerprint::compute(&image, &[]).unwrap());
    }

    #[test]
    fn test_param_order_does_not_matter() {
        let image = Image::new("img", vec![]);
        let a = Operation::new("crop").with_param("x", 1).with_param("y", 2);
        let b = Operation::new("crop").with_param("y", 2).with_param("x", 1);
        assert_eq!(
            Fingerprint::compute(&image, &[a]).unwrap(),
            Fingerprint::compute(&image, &[b]).unwrap()
        );
    }

    #[test]
    fn test_operation_serde_shape() {
        let op = Operation::new("rotate").with_param("degrees", 90);
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"name":"rotate","params":{"degrees":90}}"#);
        let bare: Operation = serde_json::from_str(r#"{"name":"grayscale"}"#).unwrap();
        assert!(bare.params.is_empty());
    }

    #[test]
    fn test_debug_hides_payload() {
        let image = Image::new("abc", vec![0; 1024]);
        assert_eq!(format!("{image:?}"), r#"Image { content_id: "abc", bytes: 1024 }"#);
    }
}
