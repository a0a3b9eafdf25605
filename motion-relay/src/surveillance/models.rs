//! Surveillance Station Web API response shapes.
//!
//! Ids arrive as numbers or strings depending on the DSM version, so they
//! are kept as raw JSON values and normalised on conversion.

use fragment_ingest::Recording;
use serde::Deserialize;
use serde_json::Value;

/// Envelope shared by every `entry.cgi` response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: i64,
}

impl<T> ApiResponse<T> {
    /// Error code reported by a failed call; `-1` when the body carries none.
    pub fn error_code(&self) -> i64 {
        self.error.as_ref().map_or(-1, |e| e.code)
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthData {
    pub sid: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CameraList {
    #[serde(default)]
    pub cameras: Vec<CameraInfo>,
}

#[derive(Debug, Deserialize)]
pub struct CameraInfo {
    pub id: Value,
    #[serde(rename = "newName")]
    pub new_name: Option<String>,
    pub name: Option<String>,
}

impl CameraInfo {
    pub fn id_string(&self) -> String {
        value_to_string(&self.id)
    }

    /// Display name, preferring the user-assigned one.
    pub fn display_name(&self) -> String {
        let non_blank = |n: &&str| !n.trim().is_empty();
        self.new_name
            .as_deref()
            .filter(non_blank)
            .or(self.name.as_deref().filter(non_blank))
            .map(str::to_string)
            .unwrap_or_else(|| fallback_camera_name(&self.id_string()))
    }
}

pub fn fallback_camera_name(camera_id: &str) -> String {
    format!("Camera {camera_id}")
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordingList {
    #[serde(default)]
    pub recordings: Vec<RecordingInfo>,
}

#[derive(Debug, Deserialize)]
pub struct RecordingInfo {
    pub id: Option<Value>,
    #[serde(rename = "cameraId")]
    pub camera_id: Option<Value>,
    #[serde(rename = "startTime")]
    pub start_time: Option<Value>,
    /// Length in milliseconds.
    pub duration: Option<Value>,
    pub size: Option<Value>,
}

impl RecordingInfo {
    /// Convert to the engine's recording type, clamping an implausible start
    /// time against `now`. `None` when the entry has no usable id.
    pub fn into_recording(self, now: i64) -> Option<Recording> {
        let id = self
            .id
            .as_ref()
            .map(value_to_string)
            .filter(|id| !id.is_empty())?;
        let channel_id = self
            .camera_id
            .as_ref()
            .map(value_to_string)
            .unwrap_or_else(|| "unknown".to_string());
        let raw_start = self.start_time.as_ref().and_then(value_to_i64).unwrap_or(0);

        let mut recording = Recording::new(
            id,
            channel_id,
            Recording::plausible_start_time(raw_start, now),
        );
        recording.duration_hint_ms = self
            .duration
            .as_ref()
            .and_then(value_to_f64)
            .map_or(0, |ms| ms.max(0.0) as u64);
        recording.size_hint_bytes = self
            .size
            .as_ref()
            .and_then(value_to_f64)
            .map_or(0, |b| b.max(0.0) as u64);
        Some(recording)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    value_to_f64(value).map(|v| v as i64)
}
