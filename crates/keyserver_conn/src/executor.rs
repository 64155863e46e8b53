use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::{abortable, AbortHandle};
use reqwest::header::ACCEPT;
use serde_json::Value;
use shared::{
    domain::{CurrentUserInfo, KeyserverId, PlatformDetails, UserInfo},
    error::POLICIES_NOT_ACCEPTED,
    protocol::{RequestData, ResponseEnvelope},
};
use tracing::debug;

use crate::{
    context::ConnectionContext,
    endpoints::{endpoint_is_socket_only, endpoint_is_socket_preferred, Endpoint},
    error::CallError,
    multipart::{HttpMultipartUploader, MultipartUpload, MultipartUploader, ProgressCallback, UploadRequest},
    session::ClientSessionChange,
    socket::SocketApiHandler,
    store::{Action, ConnectionState},
};

pub type AbortHandler = Arc<dyn Fn(AbortHandle) + Send + Sync>;
pub type SharedCaller = Arc<dyn CallSingleKeyserverEndpoint>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallTimeout {
    #[default]
    Default,
    /// Only honoured by uploads.
    Never,
    After(Duration),
}

#[derive(Clone, Default)]
pub struct CallOptions {
    pub timeout: CallTimeout,
    pub multipart: Option<MultipartUpload>,
    pub on_progress: Option<ProgressCallback>,
    pub abort_handler: Option<AbortHandler>,
    pub url_prefix_override: Option<String>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: CallTimeout::After(timeout),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait CallSingleKeyserverEndpoint: Send + Sync {
    async fn call(
        &self,
        endpoint: Endpoint,
        input: Value,
        options: CallOptions,
    ) -> Result<Value, CallError>;
}

#[async_trait]
pub trait SessionHooks: Send + Sync {
    fn set_new_session(&self, change: ClientSessionChange, error: Option<&str>);

    async fn wait_if_invalidated(&self) -> Option<SharedCaller>;

    async fn recover_invalidation(
        &self,
        change: ClientSessionChange,
        error: Option<&str>,
    ) -> Result<Option<SharedCaller>, CallError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundSession {
    pub keyserver_id: KeyserverId,
    pub cookie: Option<String>,
    pub session_id: Option<String>,
    pub url_prefix: String,
    pub is_socket_connected: bool,
    pub last_communicated_platform_details: Option<PlatformDetails>,
    pub current_user_info: Option<CurrentUserInfo>,
}

impl BoundSession {
    pub fn from_state(state: &ConnectionState, keyserver_id: &KeyserverId) -> Option<Self> {
        let session = state.keyserver(keyserver_id)?;
        Some(Self {
            keyserver_id: keyserver_id.clone(),
            cookie: session.cookie.clone(),
            session_id: session.session_id.clone(),
            url_prefix: session.url_prefix.clone(),
            is_socket_connected: session.is_socket_connected,
            last_communicated_platform_details: session.last_communicated_platform_details.clone(),
            current_user_info: state.current_user_info.clone(),
        })
    }

    pub fn logged_in(&self) -> bool {
        self.current_user_info
            .as_ref()
            .is_some_and(|info| !info.is_anonymous())
    }
}

pub struct KeyserverCaller {
    ctx: Arc<ConnectionContext>,
    session: BoundSession,
    socket: Option<Arc<dyn SocketApiHandler>>,
    hooks: Arc<dyn SessionHooks>,
}

impl KeyserverCaller {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        session: BoundSession,
        socket: Option<Arc<dyn SocketApiHandler>>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        Self {
            ctx,
            session,
            socket,
            hooks,
        }
    }

    pub fn session(&self) -> &BoundSession {
        &self.session
    }

    fn platform_details_to_send(&self) -> Option<PlatformDetails> {
        let configured = &self.ctx.config.platform_details;
        self.session
            .last_communicated_platform_details
            .as_ref()
            .filter(|last| *last != configured)
            .map(|_| configured.clone())
    }

    async fn post_json(
        &self,
        endpoint: Endpoint,
        url: &str,
        input: &Value,
        platform_details: Option<PlatformDetails>,
        timeout: CallTimeout,
    ) -> Result<Value, CallError> {
        let body = RequestData {
            input: input.clone(),
            cookie: self.session.cookie.clone(),
            session_id: self
                .ctx
                .config
                .set_session_id_on_request
                .then(|| self.session.session_id.clone()),
            platform_details,
        };
        let request = async {
            let response = self
                .ctx
                .http
                .post(url)
                .header(ACCEPT, "application/json")
                .json(&body)
                .send()
                .await?;
            let text = response.text().await?;
            parse_response(endpoint, &text)
        };
        let limit = match timeout {
            CallTimeout::After(limit) => limit,
            CallTimeout::Default | CallTimeout::Never => self.ctx.config.call_timeout,
        };
        with_timeout(endpoint, Some(limit), request).await
    }

    async fn upload(
        &self,
        endpoint: Endpoint,
        url: &str,
        input: &Value,
        upload: &MultipartUpload,
        options: &CallOptions,
    ) -> Result<Value, CallError> {
        let default_uploader;
        let uploader: &dyn MultipartUploader = match &upload.uploader {
            Some(custom) => custom.as_ref(),
            None => {
                default_uploader = HttpMultipartUploader::new(self.ctx.http.clone());
                &default_uploader
            }
        };
        let request = UploadRequest {
            endpoint,
            url,
            cookie: self.session.cookie.as_deref(),
            session_id: self.session.session_id.as_deref(),
            input,
            attachments: &upload.attachments,
            on_progress: options.on_progress.clone(),
            progress_interval: self.ctx.config.upload_progress_interval,
        };
        let (upload_future, abort_handle) = abortable(uploader.upload(request));
        if let Some(abort_handler) = &options.abort_handler {
            abort_handler(abort_handle);
        }
        let limit = match options.timeout {
            CallTimeout::After(limit) => Some(limit),
            CallTimeout::Default | CallTimeout::Never => None,
        };
        with_timeout(endpoint, limit, async {
            match upload_future.await {
                Ok(result) => result,
                Err(_aborted) => Err(CallError::UploadAborted),
            }
        })
        .await
    }

    async fn process_response(
        &self,
        endpoint: Endpoint,
        input: Value,
        options: CallOptions,
        response: Value,
        platform_details_sent: Option<PlatformDetails>,
    ) -> Result<Value, CallError> {
        self.extract_user_infos(endpoint, &response);

        let envelope: ResponseEnvelope = serde_json::from_value(response.clone())
            .map_err(|source| CallError::Parse { endpoint, source })?;
        let ResponseEnvelope {
            cookie_change,
            current_user_info,
            error,
            payload,
            ..
        } = envelope;

        if let Some(server_change) = cookie_change {
            let change = ClientSessionChange::from_server(server_change, current_user_info);
            if change.is_invalidated() {
                if let Some(replacement) = self
                    .hooks
                    .recover_invalidation(change, error.as_deref())
                    .await?
                {
                    debug!(
                        keyserver_id = %self.session.keyserver_id,
                        endpoint = %endpoint,
                        "replaying call after session recovery"
                    );
                    return replacement.call(endpoint, input, options).await;
                }
            } else {
                self.hooks.set_new_session(change, error.as_deref());
            }
        }

        if let (None, Some(platform_details)) = (&error, platform_details_sent) {
            self.ctx
                .store
                .dispatch(Action::UpdateLastCommunicatedPlatformDetails {
                    keyserver_id: self.session.keyserver_id.clone(),
                    platform_details,
                });
        }

        if error.as_deref() == Some(POLICIES_NOT_ACCEPTED) && self.session.logged_in() {
            self.ctx.store.dispatch(Action::ForcePolicyAcknowledgment {
                payload: payload.clone(),
            });
        }

        match error {
            Some(code) => Err(CallError::Server { code, payload }),
            None => Ok(response),
        }
    }

    fn extract_user_infos(&self, endpoint: Endpoint, response: &Value) {
        if let Err(reason) = self.ctx.validators.validate(endpoint, response) {
            debug!(endpoint = %endpoint, reason = %reason, "skipping user info extraction");
            return;
        }
        let mut user_infos = Vec::new();
        collect_user_infos(response.get("userInfos"), &mut user_infos);
        collect_user_infos(
            response.get("cookieChange").and_then(|c| c.get("userInfos")),
            &mut user_infos,
        );
        if !user_infos.is_empty() {
            self.ctx.store.dispatch(Action::ProcessUserInfos { user_infos });
        }
    }
}

#[async_trait]
impl CallSingleKeyserverEndpoint for KeyserverCaller {
    async fn call(
        &self,
        endpoint: Endpoint,
        input: Value,
        options: CallOptions,
    ) -> Result<Value, CallError> {
        if let Some(replacement) = self.hooks.wait_if_invalidated().await {
            debug!(
                keyserver_id = %self.session.keyserver_id,
                endpoint = %endpoint,
                "replaying queued call after session recovery"
            );
            return replacement.call(endpoint, input, options).await;
        }

        let platform_details = self.platform_details_to_send();

        if endpoint_is_socket_preferred(endpoint)
            && self.session.is_socket_connected
            && options.url_prefix_override.is_none()
        {
            if let Some(socket) = &self.socket {
                match socket.call(endpoint, input.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(err) if endpoint_is_socket_only(endpoint) => return Err(err),
                    Err(CallError::SocketOffline | CallError::SocketTimeout) => {
                        debug!(
                            keyserver_id = %self.session.keyserver_id,
                            endpoint = %endpoint,
                            "socket unavailable, falling back to HTTP"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        if endpoint_is_socket_only(endpoint) {
            return Err(CallError::SocketOffline);
        }

        let prefix = options
            .url_prefix_override
            .as_deref()
            .unwrap_or(&self.session.url_prefix);
        let url = endpoint_url(prefix, endpoint);
        let response = match &options.multipart {
            Some(upload) => self.upload(endpoint, &url, &input, upload, &options).await?,
            None => {
                self.post_json(endpoint, &url, &input, platform_details.clone(), options.timeout)
                    .await?
            }
        };
        self.process_response(endpoint, input, options, response, platform_details)
            .await
    }
}

pub fn endpoint_url(prefix: &str, endpoint: Endpoint) -> String {
    if prefix.is_empty() {
        endpoint.as_str().to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), endpoint)
    }
}

pub fn parse_response(endpoint: Endpoint, text: &str) -> Result<Value, CallError> {
    serde_json::from_str(text).map_err(|source| {
        debug!(endpoint = %endpoint, body = %text, "unparseable keyserver response");
        CallError::Parse { endpoint, source }
    })
}

async fn with_timeout<F>(
    endpoint: Endpoint,
    limit: Option<Duration>,
    request: F,
) -> Result<Value, CallError>
where
    F: Future<Output = Result<Value, CallError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, request)
            .await
            .unwrap_or(Err(CallError::FetchTimeout { endpoint })),
        None => request.await,
    }
}

fn collect_user_infos(value: Option<&Value>, out: &mut Vec<UserInfo>) {
    let items: Vec<&Value> = match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Object(map)) => map.values().collect(),
        _ => return,
    };
    out.extend(
        items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<UserInfo>(item.clone()).ok()),
    );
}

#[cfg(test)]
#[path = "tests/executor_tests.rs"]
mod tests;
