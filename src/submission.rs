use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::StoreError;

/// On-disk envelope format. Bumping this lets a future change to [`Submission`]'s
/// fields distinguish old rows during a rolling upgrade: a tagged, versioned
/// encoding rather than a language-native object graph.
const FORMAT_VERSION: u8 = 1;

/// A single unit of analysis work. Immutable once created; every field round-trips
/// through [`Submission::encode`]/[`Submission::decode`] exactly, including `files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub description: String,
    pub analysis_mode: String,
    pub tool: String,
    pub tool_instance: String,
    #[serde(rename = "type")]
    pub submission_type: String,
    // Unix seconds.
    pub event_time: i64,
    pub details: serde_json::Value,
    pub observables: Vec<serde_json::Value>,
    pub tags: Vec<String>,
    // Filesystem paths, not open handles, so the submission can be
    // serialized and re-hydrated later.
    pub files: Vec<PathBuf>,
}

impl Submission {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        description: impl Into<String>,
        analysis_mode: impl Into<String>,
        tool: impl Into<String>,
        tool_instance: impl Into<String>,
        submission_type: impl Into<String>,
        event_time: i64,
        details: serde_json::Value,
        observables: Vec<serde_json::Value>,
        tags: Vec<String>,
        files: Vec<PathBuf>,
    ) -> Self {
        Self {
            description: description.into(),
            analysis_mode: analysis_mode.into(),
            tool: tool.into(),
            tool_instance: tool_instance.into(),
            submission_type: submission_type.into(),
            event_time,
            details,
            observables,
            tags,
            files,
        }
    }

    /// Encode into the tagged, versioned blob stored in `incoming_workload.work`.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let body = bincode::serialize(self).map_err(StoreError::Serialize)?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a blob previously produced by [`Submission::encode`].
    pub fn decode(blob: &[u8]) -> Result<Self, StoreError> {
        let (version, body) = blob
            .split_first()
            .ok_or_else(|| StoreError::Deserialize(bincode_eof()))?;
        if *version != FORMAT_VERSION {
            return Err(StoreError::Deserialize(Box::new(
                bincode::ErrorKind::Custom(format!(
                    "unsupported submission envelope version {version}"
                )),
            )));
        }
        bincode::deserialize(body).map_err(StoreError::Deserialize)
    }

    /// Removes every path in `files` from the filesystem. "Does not exist" is
    /// swallowed; any other failure is logged as a warning, never raised. This
    /// must remain infallible from the caller's point of view since it runs
    /// from inside an outcome hook.
    pub fn cleanup_files(&self) {
        for path in &self.files {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "unable to delete submission file");
                }
            }
        }
    }
}

fn bincode_eof() -> bincode::Error {
    Box::new(bincode::ErrorKind::Custom("empty workload blob".to_string()))
}

/// Outcome hooks invoked by a [`crate::group::RemoteNodeGroup`] when the last
/// distribution row referencing a submission's workload reaches COMPLETED.
/// Exactly one of `on_success`/`on_failure` fires, at most once. Default
/// implementations clean up attached files; overrides must
/// remain idempotent.
pub trait SubmissionOutcome: Send + Sync {
    fn submission(&self) -> &Submission;

    fn on_success(&self) {
        self.submission().cleanup_files();
    }

    fn on_failure(&self) {
        self.submission().cleanup_files();
    }
}

/// The default outcome hook: a bare submission whose hooks just clean up files.
impl SubmissionOutcome for Submission {
    fn submission(&self) -> &Submission {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Submission {
        Submission::new(
            "test alert",
            "correlation",
            "unit-test",
            "instance-1",
            "manual",
            1_700_000_000,
            serde_json::json!({"k": "v"}),
            vec![serde_json::json!({"type": "ipv4", "value": "1.2.3.4"})],
            vec!["tag1".into(), "tag2".into()],
            vec![PathBuf::from("/tmp/does-not-matter.bin")],
        )
    }

    #[test]
    fn round_trips_every_field() {
        let original = sample();
        let blob = original.encode().unwrap();
        let decoded = Submission::decode(&blob).unwrap();
        assert_eq!(decoded.description, original.description);
        assert_eq!(decoded.analysis_mode, original.analysis_mode);
        assert_eq!(decoded.tool, original.tool);
        assert_eq!(decoded.tool_instance, original.tool_instance);
        assert_eq!(decoded.submission_type, original.submission_type);
        assert_eq!(decoded.event_time, original.event_time);
        assert_eq!(decoded.details, original.details);
        assert_eq!(decoded.observables, original.observables);
        assert_eq!(decoded.tags, original.tags);
        assert_eq!(decoded.files, original.files);
    }

    #[test]
    fn rejects_unknown_envelope_version() {
        let mut blob = sample().encode().unwrap();
        blob[0] = 0xEE;
        assert!(Submission::decode(&blob).is_err());
    }

    #[test]
    fn cleanup_files_is_idempotent_and_swallows_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attachment.bin");
        std::fs::write(&path, b"payload").unwrap();

        let sub = Submission::new(
            "d", "m", "t", "ti", "ty", 0, serde_json::json!(null), vec![], vec![], vec![path.clone()],
        );

        sub.cleanup_files();
        assert!(!path.exists());
        // Second call: file is already gone, must not panic or error.
        sub.cleanup_files();
    }
}
