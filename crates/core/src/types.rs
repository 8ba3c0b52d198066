//! Data shared by the pipeline, the queue and the HTTP front door.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    ModelLoading,
    Separating,
    Uploading,
    Notifying,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Human-readable progress string reported while the job runs.
    pub fn progress_label(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Downloading => "Downloading audio",
            Self::ModelLoading => "Loading model",
            Self::Separating => "Separating audio",
            Self::Uploading => "Uploading stems",
            Self::Notifying => "Sending webhook",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::ModelLoading => "model_loading",
            Self::Separating => "separating",
            Self::Uploading => "uploading",
            Self::Notifying => "notifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StemType {
    Drums,
    Bass,
    Other,
    Vocals,
    Guitar,
    Piano,
}

impl StemType {
    /// Upload and reporting order.
    pub const CANONICAL: [StemType; 6] = [
        StemType::Drums,
        StemType::Bass,
        StemType::Other,
        StemType::Vocals,
        StemType::Guitar,
        StemType::Piano,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drums => "drums",
            Self::Bass => "bass",
            Self::Other => "other",
            Self::Vocals => "vocals",
            Self::Guitar => "guitar",
            Self::Piano => "piano",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Drums => "Drums",
            Self::Bass => "Bass",
            Self::Other => "Other",
            Self::Vocals => "Vocals",
            Self::Guitar => "Guitar",
            Self::Piano => "Piano",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.wav", self.as_str())
    }
}

impl fmt::Display for StemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StemType {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        match Self::CANONICAL
            .into_iter()
            .find(|stem| stem.as_str() == normalized)
        {
            Some(stem) => Ok(stem),
            None => bail!("unknown stem type '{raw}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stem {
    pub stem_type: StemType,
    pub display_name: String,
    pub storage_url: String,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    /// `sha256:<hex>` over the stem bytes.
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// Body of the terminal webhook. Field order is part of the wire format: receivers
/// recompute the signature over the exact bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub job_id: String,
    pub status: OutcomeStatus,
    pub stems: Vec<Stem>,
    pub error: Option<String>,
    pub processing_time_ms: u64,
}

impl WebhookPayload {
    pub fn completed(job_id: impl Into<String>, stems: Vec<Stem>, processing_time_ms: u64) -> Self {
        Self {
            job_id: job_id.into(),
            status: OutcomeStatus::Completed,
            stems,
            error: None,
            processing_time_ms,
        }
    }

    pub fn failed(
        job_id: impl Into<String>,
        error: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: OutcomeStatus::Failed,
            stems: Vec::new(),
            error: Some(error.into()),
            processing_time_ms,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Everything a worker needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub input_locator: String,
    pub model_name: String,
    pub callback_url: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Body of `POST /split`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub version_id: String,
    #[serde(alias = "audio_url")]
    pub input_locator: String,
    #[serde(alias = "ai_model")]
    pub model_name: String,
    #[serde(alias = "webhook")]
    pub callback_url: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl SplitRequest {
    pub fn into_descriptor(self) -> JobDescriptor {
        JobDescriptor {
            job_id: self.version_id,
            input_locator: self.input_locator,
            model_name: self.model_name,
            callback_url: self.callback_url,
            correlation_id: self.correlation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: OutcomeStatus,
    pub job_id: String,
    pub processing_time_ms: u64,
    pub stem_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_serializes_snake_case() {
        let encoded = serde_json::to_string(&JobStatus::ModelLoading).unwrap();
        assert_eq!(encoded, "\"model_loading\"");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Notifying.is_terminal());
        assert_eq!(JobStatus::Uploading.progress_label(), "Uploading stems");
    }

    #[test]
    fn stem_type_parses_case_insensitively() {
        assert_eq!("Vocals".parse::<StemType>().unwrap(), StemType::Vocals);
        assert_eq!(" drums ".parse::<StemType>().unwrap(), StemType::Drums);
        assert!("kazoo".parse::<StemType>().is_err());
        assert_eq!(StemType::Bass.file_name(), "bass.wav");
    }

    #[test]
    fn canonical_order_is_sorted_order() {
        let mut shuffled = vec![StemType::Vocals, StemType::Piano, StemType::Drums, StemType::Other];
        shuffled.sort();
        assert_eq!(
            shuffled,
            vec![StemType::Drums, StemType::Other, StemType::Vocals, StemType::Piano]
        );
    }

    #[test]
    fn webhook_payload_field_order_is_stable() {
        let payload = WebhookPayload::completed(
            "v-1",
            vec![Stem {
                stem_type: StemType::Drums,
                display_name: "Drums".to_string(),
                storage_url: "https://bucket.s3.us-east-1.amazonaws.com/v-1/drums.wav".to_string(),
                size_bytes: 10,
                duration_seconds: 1.5,
                checksum: "sha256:00".to_string(),
            }],
            1234,
        );

        let json = payload.to_json().unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"job_id":"v-1","status":"completed","stems":[{"stem_type":"drums","#,
                r#""display_name":"Drums","storage_url":"https://bucket.s3.us-east-1.amazonaws.com/v-1/drums.wav","#,
                r#""size_bytes":10,"duration_seconds":1.5,"checksum":"sha256:00"}],"#,
                r#""error":null,"processing_time_ms":1234}"#
            )
        );
    }

    #[test]
    fn failed_payload_has_no_stems_and_an_error() {
        let payload = WebhookPayload::failed("v-2", "download failed", 7);
        let value: serde_json::Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["stems"], serde_json::json!([]));
        assert_eq!(value["error"], "download failed");
        assert_eq!(value["processing_time_ms"], 7);
    }

    #[test]
    fn split_request_accepts_legacy_field_names() {
        let request: SplitRequest = serde_json::from_value(serde_json::json!({
            "version_id": "v-9",
            "audio_url": "https://cdn.example.com/a.mp3",
            "ai_model": "htdemucs",
            "webhook": "https://api.example.com/webhooks/demucs"
        }))
        .unwrap();

        let descriptor = request.into_descriptor();
        assert_eq!(descriptor.job_id, "v-9");
        assert_eq!(descriptor.input_locator, "https://cdn.example.com/a.mp3");
        assert_eq!(descriptor.model_name, "htdemucs");
        assert_eq!(descriptor.correlation_id, None);
    }
}
