use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::submission::Submission;

/// The sole abstract extension point: implementations supply domain-specific
/// sources (mailbox pollers, directory watchers, upstream queues). Modeled as
/// a boxed trait object rather than an abstract base class.
#[async_trait]
pub trait ProducerSource: Send + Sync {
    /// Returns the next submission, or `None` if nothing is available right
    /// now (the collector sleeps 1s and asks again).
    async fn get_next_submission(&mut self) -> Result<Option<Submission>, ProducerError>;

    /// Producers are cloned once per `Collector::start()` so the producer
    /// worker owns an independent instance from whatever the caller retains.
    fn clone_box(&self) -> Box<dyn ProducerSource>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("producer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed submission descriptor {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Minimal on-disk descriptor for [`DirectoryProducer`]: a JSON sidecar next to
/// zero or more attachment files, all referenced by path.
#[derive(Debug, serde::Deserialize)]
struct SubmissionDescriptor {
    description: String,
    analysis_mode: String,
    tool: String,
    tool_instance: String,
    #[serde(rename = "type")]
    submission_type: String,
    event_time: i64,
    #[serde(default = "serde_json::Value::default")]
    details: serde_json::Value,
    #[serde(default)]
    observables: Vec<serde_json::Value>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    files: Vec<PathBuf>,
}

/// A concrete, illustrative producer: polls a directory for `*.json`
/// submission descriptors and turns each into a [`Submission`]. Ships so the
/// crate is runnable end-to-end; real deployments supply their own
/// [`ProducerSource`] (the concrete producer is an external collaborator,
/// not part of the dispatch engine itself).
#[derive(Clone)]
pub struct DirectoryProducer {
    inbox: PathBuf,
}

impl DirectoryProducer {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self { inbox: inbox.into() }
    }

    async fn next_descriptor_path(&self) -> Result<Option<PathBuf>, ProducerError> {
        let mut entries = match tokio::fs::read_dir(&self.inbox).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                candidates.push(path);
            }
        }
        candidates.sort();
        Ok(candidates.into_iter().next())
    }

    fn descriptor_to_submission(path: &Path, descriptor: SubmissionDescriptor) -> Submission {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let files = descriptor
            .files
            .into_iter()
            .map(|f| if f.is_absolute() { f } else { base.join(f) })
            .collect();

        Submission::new(
            descriptor.description,
            descriptor.analysis_mode,
            descriptor.tool,
            descriptor.tool_instance,
            descriptor.submission_type,
            descriptor.event_time,
            descriptor.details,
            descriptor.observables,
            descriptor.tags,
            files,
        )
    }
}

#[async_trait]
impl ProducerSource for DirectoryProducer {
    async fn get_next_submission(&mut self) -> Result<Option<Submission>, ProducerError> {
        let Some(path) = self.next_descriptor_path().await? else {
            return Ok(None);
        };

        let raw = tokio::fs::read_to_string(&path).await?;
        let descriptor: SubmissionDescriptor =
            serde_json::from_str(&raw).map_err(|e| ProducerError::Malformed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let submission = Self::descriptor_to_submission(&path, descriptor);

        // Consume the descriptor so the next poll doesn't pick it up again.
        // The referenced attachment files are left in place; their lifecycle
        // is owned by the submission's outcome hooks from this point on.
        tokio::fs::remove_file(&path).await?;

        Ok(Some(submission))
    }

    fn clone_box(&self) -> Box<dyn ProducerSource> {
        Box::new(self.clone())
    }
}
