use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::{
    header::ACCEPT,
    multipart::{Form, Part},
    Body, Client,
};
use serde_json::Value;
use tracing::debug;

use crate::{endpoints::Endpoint, error::CallError, executor::parse_response};

const UPLOAD_CHUNK_SIZE: usize = 16 * 1024;

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Marks a call as an upload. Without a custom `uploader` the request goes
/// through [`HttpMultipartUploader`].
#[derive(Clone, Default)]
pub struct MultipartUpload {
    pub attachments: Vec<Attachment>,
    pub uploader: Option<Arc<dyn MultipartUploader>>,
}

pub struct UploadRequest<'a> {
    pub endpoint: Endpoint,
    pub url: &'a str,
    pub cookie: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub input: &'a Value,
    pub attachments: &'a [Attachment],
    pub on_progress: Option<ProgressCallback>,
    pub progress_interval: Duration,
}

#[async_trait]
pub trait MultipartUploader: Send + Sync {
    async fn upload(&self, request: UploadRequest<'_>) -> Result<Value, CallError>;
}

pub struct HttpMultipartUploader {
    http: Client,
}

impl HttpMultipartUploader {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MultipartUploader for HttpMultipartUploader {
    async fn upload(&self, request: UploadRequest<'_>) -> Result<Value, CallError> {
        let total: usize = request.attachments.iter().map(|a| a.bytes.len()).sum();
        let progress = ProgressTracker::new(total, request.on_progress, request.progress_interval);

        let mut form = Form::new().text("cookie", request.cookie.unwrap_or_default().to_string());
        if let Some(session_id) = request.session_id {
            form = form.text("sessionID", session_id.to_string());
        }
        if let Value::Object(fields) = request.input {
            for (key, value) in fields {
                if let Value::String(text) = value {
                    form = form.text(key.clone(), text.clone());
                }
            }
        }
        for attachment in request.attachments {
            let length = attachment.bytes.len() as u64;
            let mut part = Part::stream_with_length(progress.body(attachment.bytes.clone()), length)
                .file_name(attachment.filename.clone());
            if let Some(mime_type) = &attachment.mime_type {
                part = part.mime_str(mime_type)?;
            }
            form = form.part("multimedia", part);
        }

        debug!(endpoint = %request.endpoint, bytes = total, "uploading multipart request");
        let response = self
            .http
            .post(request.url)
            .header(ACCEPT, "application/json")
            .multipart(form)
            .send()
            .await?;
        let text = response.text().await?;
        progress.finish();
        parse_response(request.endpoint, &text)
    }
}

#[derive(Clone)]
struct ProgressTracker {
    inner: Arc<Mutex<ProgressState>>,
    on_progress: Option<ProgressCallback>,
    interval: Duration,
    total: usize,
}

struct ProgressState {
    sent: usize,
    last_report: Option<Instant>,
}

impl ProgressTracker {
    fn new(total: usize, on_progress: Option<ProgressCallback>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProgressState {
                sent: 0,
                last_report: None,
            })),
            on_progress,
            interval,
            total,
        }
    }

    fn body(&self, bytes: Vec<u8>) -> Body {
        let tracker = self.clone();
        let chunks: Vec<Vec<u8>> = bytes.chunks(UPLOAD_CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            tracker.advance(chunk.len());
            Ok::<_, std::io::Error>(chunk)
        }));
        Body::wrap_stream(stream)
    }

    fn advance(&self, bytes: usize) {
        let Some(on_progress) = &self.on_progress else {
            return;
        };
        let fraction = {
            let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            state.sent += bytes;
            let due = state
                .last_report
                .map_or(true, |last| last.elapsed() >= self.interval);
            if !due {
                return;
            }
            state.last_report = Some(Instant::now());
            if self.total == 0 {
                0.0
            } else {
                state.sent as f64 / self.total as f64
            }
        };
        on_progress(fraction.min(1.0));
    }

    fn finish(&self) {
        if let Some(on_progress) = &self.on_progress {
            on_progress(1.0);
        }
    }
}
