use rollcall_core::attendance::AttendanceConfig;
use rollcall_core::classifier::{ACCEPT_ACCURACY, PROBABILITY_THRESHOLD};
use rollcall_core::enrollment::EnrollmentConfig;
use rollcall_core::landmarker::MESH_PRESENCE_THRESHOLD;
use rollcall_core::matcher::FALLBACK_THRESHOLD;
use rollcall_core::session::SessionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid roster file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("roster lists no groups")]
    NoGroups,
}

/// Groups and subjects offered by the enrollment and subject dialogs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Roster {
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    #[serde(default = "default_subjects")]
    pub subjects: Vec<String>,
}

impl Default for Roster {
    fn default() -> Self {
        Self {
            groups: default_groups(),
            subjects: default_subjects(),
        }
    }
}

fn default_groups() -> Vec<String> {
    vec!["7O".into(), "7P".into()]
}

fn default_subjects() -> Vec<String> {
    vec!["ML".into(), "PDI".into()]
}

impl Roster {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let roster: Roster = toml::from_str(text)?;
        if roster.groups.is_empty() {
            return Err(ConfigError::NoGroups);
        }
        Ok(roster)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Group used when an enrollment request leaves it blank.
    pub fn default_group(&self) -> &str {
        self.groups.first().map_or("-", String::as_str)
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Replay still images from this directory instead of opening the camera.
    pub image_dir: Option<PathBuf>,
    /// Directory containing the face-mesh ONNX model.
    pub model_dir: PathBuf,
    /// Identity store, classifier snapshots and the attendance database live here.
    pub data_dir: PathBuf,
    /// Minimum face-presence probability reported by the landmark model.
    pub presence_threshold: f32,
    /// Minimum classifier probability for an attribution.
    pub probability_threshold: f32,
    /// Maximum Euclidean distance for the fallback matcher.
    pub fallback_threshold: f32,
    /// Training accuracy a retrained classifier needs to replace the active one.
    pub accept_accuracy: f32,
    pub exit_after_secs: u64,
    pub debounce_ms: u64,
    pub stale_after_secs: u64,
    /// Sampling window per enrollment pose.
    pub pose_window_secs: u64,
    pub pose_retries: u32,
    pub yaw_threshold: f32,
    /// Whether enrollment runs a bulk capture before the pose capture.
    pub bulk_enabled: bool,
    pub bulk_target: usize,
    pub bulk_timeout_secs: u64,
    pub capture_start_timeout_secs: u64,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
    pub roster: Roster,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    /// `ROLLCALL_CONFIG` names an optional TOML roster file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("ROLLCALL_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            lookup("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("rollcall")
        });

        let model_dir = lookup("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));

        let roster = match lookup("ROLLCALL_CONFIG") {
            Some(path) => Roster::load(Path::new(&path))?,
            None => Roster::default(),
        };

        Ok(Self {
            camera_device: lookup("ROLLCALL_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: env_or(&lookup, "ROLLCALL_FRAME_WIDTH", 640),
            frame_height: env_or(&lookup, "ROLLCALL_FRAME_HEIGHT", 480),
            image_dir: lookup("ROLLCALL_IMAGE_DIR").map(PathBuf::from),
            model_dir,
            data_dir,
            presence_threshold: env_or(&lookup, "ROLLCALL_PRESENCE_THRESHOLD", MESH_PRESENCE_THRESHOLD),
            probability_threshold: env_or(&lookup, "ROLLCALL_PROBABILITY_THRESHOLD", PROBABILITY_THRESHOLD),
            fallback_threshold: env_or(&lookup, "ROLLCALL_FALLBACK_THRESHOLD", FALLBACK_THRESHOLD),
            accept_accuracy: env_or(&lookup, "ROLLCALL_ACCEPT_ACCURACY", ACCEPT_ACCURACY),
            exit_after_secs: env_or(&lookup, "ROLLCALL_EXIT_AFTER_SECS", 30),
            debounce_ms: env_or(&lookup, "ROLLCALL_DEBOUNCE_MS", 1200),
            stale_after_secs: env_or(&lookup, "ROLLCALL_STALE_AFTER_SECS", 30),
            pose_window_secs: env_or(&lookup, "ROLLCALL_POSE_WINDOW_SECS", 4),
            pose_retries: env_or(&lookup, "ROLLCALL_POSE_RETRIES", 2),
            yaw_threshold: env_or(&lookup, "ROLLCALL_YAW_THRESHOLD", 12.0),
            bulk_enabled: lookup("ROLLCALL_BULK_ENABLED").map(|v| v != "0").unwrap_or(true),
            bulk_target: env_or(&lookup, "ROLLCALL_BULK_TARGET", 20),
            bulk_timeout_secs: env_or(&lookup, "ROLLCALL_BULK_TIMEOUT_SECS", 20),
            capture_start_timeout_secs: env_or(&lookup, "ROLLCALL_CAPTURE_START_TIMEOUT_SECS", 120),
            session_bus: lookup("ROLLCALL_SESSION_BUS").is_some(),
            roster,
        })
    }

    /// Path to the face-mesh landmark model.
    pub fn face_mesh_model_path(&self) -> String {
        self.model_dir
            .join("face_mesh.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn identity_store_path(&self) -> PathBuf {
        self.data_dir.join("identities.json")
    }

    pub fn attendance_db_path(&self) -> PathBuf {
        self.data_dir.join("attendance.db")
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            probability_threshold: self.probability_threshold,
            fallback_threshold: self.fallback_threshold,
            attendance: AttendanceConfig {
                exit_after: Duration::from_secs(self.exit_after_secs),
                debounce: Duration::from_millis(self.debounce_ms),
                stale_after: Duration::from_secs(self.stale_after_secs),
            },
        }
    }

    pub fn enrollment(&self) -> EnrollmentConfig {
        EnrollmentConfig {
            pose_window: Duration::from_secs(self.pose_window_secs),
            max_retries: self.pose_retries,
            yaw_threshold: self.yaw_threshold,
            bulk_enabled: self.bulk_enabled,
            bulk_target: self.bulk_target,
            bulk_timeout: Duration::from_secs(self.bulk_timeout_secs),
            start_timeout: Duration::from_secs(self.capture_start_timeout_secs),
        }
    }
}

fn env_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
