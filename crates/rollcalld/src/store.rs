//! On-disk identity store and classifier snapshots.
//!
//! Both are JSON files in the data directory, written through a temporary
//! file and renamed into place.

use rollcall_core::identity::{decode_gallery, encode_gallery};
use rollcall_core::{Angle, ClassifierModel, Gallery};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no identity named {0:?}")]
    UnknownIdentity(String),
    #[error("an identity named {0:?} already exists")]
    NameTaken(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
    std::fs::rename(&tmp, path).map_err(io_error(path))
}

/// JSON identity store: name → {registration, group, subject, samples}.
pub struct SampleStore {
    path: PathBuf,
}

impl SampleStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the gallery. A missing, unreadable or malformed file yields an
    /// empty gallery; individual bad entries are dropped by the decoder.
    pub fn load(&self) -> Gallery {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no identity store yet");
                return Gallery::new();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "identity store unreadable, starting empty");
                return Gallery::new();
            }
        };
        match serde_json::from_str(&text) {
            Ok(root) => {
                let gallery = decode_gallery(root);
                tracing::info!(path = %self.path.display(), identities = gallery.len(), "identity store loaded");
                gallery
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "identity store is not valid JSON, starting empty");
                Gallery::new()
            }
        }
    }

    pub fn save(&self, gallery: &Gallery) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&encode_gallery(gallery))?;
        write_atomic(&self.path, &bytes)?;
        tracing::debug!(path = %self.path.display(), identities = gallery.len(), "identity store saved");
        Ok(())
    }
}

/// One row of the identity listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub name: String,
    pub registration: String,
    pub group: String,
    pub subject: String,
    pub angles: Vec<Angle>,
}

pub fn list(gallery: &Gallery) -> Vec<IdentitySummary> {
    gallery
        .iter()
        .map(|(name, record)| IdentitySummary {
            name: name.clone(),
            registration: record.registration.clone(),
            group: record.group.clone(),
            subject: record.subject.clone(),
            angles: record.available().map(|(angle, _)| angle).collect(),
        })
        .collect()
}

/// Identities whose name or registration contains `query`, ignoring case.
pub fn search(gallery: &Gallery, query: &str) -> Vec<IdentitySummary> {
    let needle = query.trim().to_lowercase();
    list(gallery)
        .into_iter()
        .filter(|s| s.name.to_lowercase().contains(&needle) || s.registration.to_lowercase().contains(&needle))
        .collect()
}

/// Field changes for an identity; blank fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct IdentityUpdate {
    pub name: String,
    pub registration: String,
    pub group: String,
    pub subject: String,
}

fn non_blank(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|v| !v.is_empty())
}

/// Apply `update` to `name`. Returns the identity's name afterwards.
pub fn update(gallery: &mut Gallery, name: &str, update: &IdentityUpdate) -> Result<String, StoreError> {
    let new_name = non_blank(&update.name).unwrap_or(name).to_string();
    if new_name != name && gallery.contains_key(&new_name) {
        return Err(StoreError::NameTaken(new_name));
    }
    let mut record = gallery
        .remove(name)
        .ok_or_else(|| StoreError::UnknownIdentity(name.to_string()))?;
    if let Some(registration) = non_blank(&update.registration) {
        record.registration = registration.to_string();
    }
    if let Some(group) = non_blank(&update.group) {
        record.group = group.to_string();
    }
    if let Some(subject) = non_blank(&update.subject) {
        record.subject = subject.to_string();
    }
    gallery.insert(new_name.clone(), record);
    Ok(new_name)
}

pub fn remove(gallery: &mut Gallery, name: &str) -> Result<(), StoreError> {
    gallery
        .remove(name)
        .map(|_| ())
        .ok_or_else(|| StoreError::UnknownIdentity(name.to_string()))
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    sha256: String,
    payload: String,
}

fn digest(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

/// Classifier snapshots: the active model plus archived rejected candidates.
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn active_path(&self) -> PathBuf {
        self.dir.join("model.json")
    }

    pub fn archive_path(&self, unix_ts: i64) -> PathBuf {
        self.dir.join(format!("model_weak_{unix_ts}.json"))
    }

    fn write(&self, path: &Path, model: &ClassifierModel) -> Result<(), StoreError> {
        let payload = serde_json::to_string(model)?;
        let snapshot = Snapshot {
            sha256: digest(&payload),
            payload,
        };
        write_atomic(path, &serde_json::to_vec(&snapshot)?)
    }

    pub fn save_active(&self, model: &ClassifierModel) -> Result<(), StoreError> {
        let path = self.active_path();
        self.write(&path, model)?;
        tracing::info!(path = %path.display(), "active classifier saved");
        Ok(())
    }

    /// Keep a rejected candidate for inspection; never replaces the active model.
    pub fn archive(&self, model: &ClassifierModel, unix_ts: i64) -> Result<PathBuf, StoreError> {
        let path = self.archive_path(unix_ts);
        self.write(&path, model)?;
        tracing::info!(path = %path.display(), "weak classifier archived");
        Ok(path)
    }

    /// The active model, or `None` when it is missing, corrupt or fails its digest.
    pub fn load(&self) -> Option<ClassifierModel> {
        let path = self.active_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "classifier snapshot unreadable");
                return None;
            }
        };
        let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "classifier snapshot malformed");
                return None;
            }
        };
        if digest(&snapshot.payload) != snapshot.sha256 {
            tracing::warn!(path = %path.display(), "classifier snapshot digest mismatch, ignoring");
            return None;
        }
        match serde_json::from_str(&snapshot.payload) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "classifier payload malformed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::classifier::{retrain, RetrainOutcome};
    use rollcall_core::types::Samples;
    use rollcall_core::IdentityRecord;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcalld-store-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record(registration: &str, frontal: Vec<f32>) -> IdentityRecord {
        let mut samples = Samples::new();
        samples.insert(Angle::Frontal, Some(frontal));
        samples.insert(Angle::Right, None);
        samples.insert(Angle::Left, None);
        IdentityRecord::new(registration, "7O", "ML", samples)
    }

    fn gallery() -> Gallery {
        let mut g = Gallery::new();
        g.insert("Ana Ruiz".into(), record("A-100", vec![0.1, 0.2, 0.3]));
        g.insert("Luis Pérez".into(), record("B-200", vec![0.9, 0.8, 0.7]));
        g
    }

    #[test]
    fn test_missing_store_is_empty() {
        let dir = scratch_dir("missing");
        let store = SampleStore::new(dir.join("identities.json"));
        assert!(store.load().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_save_then_load() {
        let dir = scratch_dir("save");
        let store = SampleStore::new(dir.join("nested").join("identities.json"));
        let g = gallery();
        store.save(&g).unwrap();
        assert!(!dir.join("nested").join("identities.json.tmp").exists());
        assert_eq!(store.load(), g);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_garbage_store_is_empty() {
        let dir = scratch_dir("garbage");
        let path = dir.join("identities.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(SampleStore::new(path.clone()).load().is_empty());
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(SampleStore::new(path).load().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_search_matches_name_or_registration() {
        let g = gallery();
        let by_name: Vec<String> = search(&g, "ana").into_iter().map(|s| s.name).collect();
        assert_eq!(by_name, vec!["Ana Ruiz"]);
        let by_reg: Vec<String> = search(&g, "b-2").into_iter().map(|s| s.name).collect();
        assert_eq!(by_reg, vec!["Luis Pérez"]);
        assert!(search(&g, "zzz").is_empty());
        assert_eq!(list(&g)[0].angles, vec![Angle::Frontal]);
    }

    #[test]
    fn test_update_and_rename() {
        let mut g = gallery();
        let change = IdentityUpdate {
            name: "Ana R.".into(),
            registration: " ".into(),
            group: "7P".into(),
            subject: String::new(),
        };
        assert_eq!(update(&mut g, "Ana Ruiz", &change).unwrap(), "Ana R.");
        assert!(!g.contains_key("Ana Ruiz"));
        let ana = &g["Ana R."];
        assert_eq!(ana.registration, "A-100");
        assert_eq!(ana.group, "7P");
        assert_eq!(ana.subject, "ML");

        let clash = IdentityUpdate {
            name: "Luis Pérez".into(),
            ..Default::default()
        };
        assert!(matches!(update(&mut g, "Ana R.", &clash), Err(StoreError::NameTaken(_))));
        assert!(g.contains_key("Ana R."));
        assert!(matches!(
            update(&mut g, "Nadie", &IdentityUpdate::default()),
            Err(StoreError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn test_remove() {
        let mut g = gallery();
        remove(&mut g, "Ana Ruiz").unwrap();
        assert_eq!(g.len(), 1);
        assert!(matches!(remove(&mut g, "Ana Ruiz"), Err(StoreError::UnknownIdentity(_))));
    }

    fn trained_model() -> ClassifierModel {
        let mut g = Gallery::new();
        for i in 0..3 {
            let v: Vec<f32> = (0..8).map(|j| ((i + 1) * (j + 2) % 5) as f32 + i as f32).collect();
            g.insert(format!("p{i}"), record("-", v));
        }
        match retrain(&g, 8, 0.0) {
            RetrainOutcome::Accepted { model, .. } => model,
            other => panic!("expected a model, got {other:?}"),
        }
    }

    #[test]
    fn test_model_snapshot_roundtrip_and_tamper() {
        let dir = scratch_dir("model");
        let models = ModelStore::new(dir.clone());
        assert!(models.load().is_none());

        let model = trained_model();
        models.save_active(&model).unwrap();
        let loaded = models.load().unwrap();
        assert_eq!(loaded.n_features(), model.n_features());

        let mut snapshot: serde_json::Value =
            serde_json::from_slice(&std::fs::read(models.active_path()).unwrap()).unwrap();
        snapshot["sha256"] = serde_json::Value::String("0".repeat(64));
        std::fs::write(models.active_path(), serde_json::to_vec(&snapshot).unwrap()).unwrap();
        assert!(models.load().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_archive_leaves_active_untouched() {
        let dir = scratch_dir("archive");
        let models = ModelStore::new(dir.clone());
        let path = models.archive(&trained_model(), 1_700_000_000).unwrap();
        assert_eq!(path.file_name().unwrap(), "model_weak_1700000000.json");
        assert!(path.exists());
        assert!(models.load().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
