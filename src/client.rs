use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::registry::RemoteNode;
use crate::submission::Submission;

/// Result of one successful submission attempt.
#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub remote_id: Option<String>,
}

/// Stateless, thread-safe adapter that performs one submission attempt against
/// one node. Does not retry; retry/policy lives in the group.
#[async_trait]
pub trait RemoteNodeClient: Send + Sync {
    async fn submit(&self, node: &RemoteNode, submission: &Submission) -> Result<SubmitResult, ClientError>;
}

/// `reqwest`-backed client. Opens every attachment path as a file, POSTs a
/// multipart payload to `node.location`, and closes every handle before
/// returning on both the success and error paths.
pub struct HttpRemoteNodeClient {
    http: reqwest::Client,
}

impl HttpRemoteNodeClient {
    pub fn new(ca_chain_path: Option<&Path>, timeout: Duration) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);

        if let Some(path) = ca_chain_path {
            let pem = std::fs::read(path).map_err(|source| ClientError::OpenFile {
                path: path.display().to_string(),
                source,
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|source| ClientError::Transport {
                location: path.display().to_string(),
                source,
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder.build().map_err(|source| ClientError::Transport {
            location: "<client build>".to_string(),
            source,
        })?;

        Ok(Self { http })
    }
}

#[async_trait]
impl RemoteNodeClient for HttpRemoteNodeClient {
    async fn submit(&self, node: &RemoteNode, submission: &Submission) -> Result<SubmitResult, ClientError> {
        let mut form = reqwest::multipart::Form::new()
            .text("description", submission.description.clone())
            .text("analysis_mode", submission.analysis_mode.clone())
            .text("tool", submission.tool.clone())
            .text("tool_instance", submission.tool_instance.clone())
            .text("type", submission.submission_type.clone())
            .text("event_time", submission.event_time.to_string())
            .text("details", submission.details.to_string())
            .text("observables", serde_json::to_string(&submission.observables).unwrap_or_default())
            .text("tags", serde_json::to_string(&submission.tags).unwrap_or_default());

        // Open every attachment before sending, close every handle on both the
        // success and error paths. `reqwest`'s multipart `Part`
        // takes ownership of the stream and closes it once the request
        // completes or fails, so the explicit-close half of that contract is
        // satisfied by the request's own drop.
        for path in &submission.files {
            let file = tokio::fs::File::open(path).await.map_err(|source| ClientError::OpenFile {
                path: path.display().to_string(),
                source,
            })?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            let stream = tokio_util_reader_stream(file);
            let part = reqwest::multipart::Part::stream(stream).file_name(file_name);
            form = form.part("files", part);
        }

        let url = format!("{}/api/submit", node.location.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                location: node.location.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        #[derive(serde::Deserialize, Default)]
        struct Ack {
            #[serde(default)]
            id: Option<String>,
        }
        let ack: Ack = response.json().await.unwrap_or_default();
        Ok(SubmitResult { remote_id: ack.id })
    }
}

fn tokio_util_reader_stream(file: tokio::fs::File) -> reqwest::Body {
    reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file))
}
