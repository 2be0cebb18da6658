//! Enrolled identities and schema-normalizing gallery decoding.

use crate::types::{Angle, FeatureVector, Samples};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Placeholder for registration, group and subject fields that were never set.
pub const UNSET: &str = "-";

/// One enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(default = "unset", alias = "registro")]
    pub registration: String,
    #[serde(default = "unset", alias = "grupo")]
    pub group: String,
    #[serde(default = "unset", alias = "materia")]
    pub subject: String,
    #[serde(default)]
    pub samples: Samples,
}

fn unset() -> String {
    UNSET.to_string()
}

impl IdentityRecord {
    pub fn new(registration: &str, group: &str, subject: &str, samples: Samples) -> Self {
        Self {
            registration: registration.to_string(),
            group: group.to_string(),
            subject: subject.to_string(),
            samples,
        }
    }

    /// Captured vectors, skipping absent angles.
    pub fn available(&self) -> impl Iterator<Item = (Angle, &FeatureVector)> {
        self.samples
            .iter()
            .filter_map(|(angle, v)| v.as_ref().map(|v| (*angle, v)))
    }

    pub fn has_samples(&self) -> bool {
        self.available().next().is_some()
    }
}

/// All enrolled identities keyed by unique name.
pub type Gallery = BTreeMap<String, IdentityRecord>;

/// Shapes an identity entry has been stored in over time.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Current(RawRecord),
    /// A bare vector: the oldest stores kept a single frontal sample per name.
    Legacy(Vec<f64>),
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default = "unset", alias = "registro")]
    registration: String,
    #[serde(default = "unset", alias = "grupo")]
    group: String,
    #[serde(default = "unset", alias = "materia")]
    subject: String,
    #[serde(alias = "muestras")]
    samples: BTreeMap<String, Value>,
}

/// Decode a stored gallery, normalizing legacy shapes and dropping anything
/// unusable. Never fails: a non-object root yields an empty gallery.
pub fn decode_gallery(root: Value) -> Gallery {
    let Value::Object(entries) = root else {
        tracing::warn!("identity store root is not a mapping, starting empty");
        return Gallery::new();
    };

    let mut gallery = Gallery::new();
    for (name, value) in entries {
        let record = match serde_json::from_value::<StoredEntry>(value) {
            Ok(StoredEntry::Current(raw)) => decode_current(&name, raw),
            Ok(StoredEntry::Legacy(vector)) => decode_legacy(vector),
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "unrecognized identity entry, dropping");
                continue;
            }
        };

        if record.has_samples() {
            gallery.insert(name, record);
        } else {
            tracing::warn!(name = %name, "identity has no usable samples, dropping");
        }
    }
    gallery
}

fn decode_current(name: &str, raw: RawRecord) -> IdentityRecord {
    let mut samples = Samples::new();
    for (tag, value) in raw.samples {
        let Some(angle) = Angle::parse(&tag) else {
            tracing::warn!(name, tag = %tag, "unknown sample angle, ignoring");
            continue;
        };
        samples.insert(angle, decode_vector(name, angle, value));
    }
    IdentityRecord {
        registration: raw.registration,
        group: raw.group,
        subject: raw.subject,
        samples,
    }
}

fn decode_legacy(vector: Vec<f64>) -> IdentityRecord {
    let mut samples = Samples::new();
    samples.insert(Angle::Frontal, to_feature(vector));
    for angle in [Angle::Right, Angle::Left] {
        samples.insert(angle, None);
    }
    IdentityRecord::new(UNSET, UNSET, UNSET, samples)
}

fn decode_vector(name: &str, angle: Angle, value: Value) -> Option<FeatureVector> {
    if value.is_null() {
        return None;
    }
    match serde_json::from_value::<Vec<f64>>(value) {
        Ok(v) => to_feature(v),
        Err(e) => {
            tracing::warn!(name, angle = %angle, error = %e, "malformed sample vector, treating as absent");
            None
        }
    }
}

/// An empty vector counts as absent.
fn to_feature(v: Vec<f64>) -> Option<FeatureVector> {
    if v.is_empty() {
        None
    } else {
        Some(v.into_iter().map(|x| x as f32).collect())
    }
}

/// Encode a gallery in the current schema; vectors become plain numeric arrays.
pub fn encode_gallery(gallery: &Gallery) -> Value {
    // Serializing string-keyed maps of plain data cannot fail.
    serde_json::to_value(gallery).unwrap_or(Value::Null)
}
