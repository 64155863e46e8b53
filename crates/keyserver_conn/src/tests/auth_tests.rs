use super::*;
use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::{
    executor::SharedCaller,
    fanout::KeyserverResponses,
    store::{StateStore, StateStoreExt},
    test_support::{config_for, logged_in_context, FakeIdentity, FakeOlm, AUTHORITATIVE, SECONDARY},
};

#[derive(Default)]
struct ScriptedAuthEndpoint {
    replies: Mutex<VecDeque<Result<Value, CallError>>>,
    requests: Mutex<Vec<(Endpoint, KeyserverRequests)>>,
}

impl ScriptedAuthEndpoint {
    fn with_replies(replies: Vec<Result<Value, CallError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::default(),
        }
    }
}

#[async_trait]
impl CallKeyserverEndpoint for ScriptedAuthEndpoint {
    fn caller(&self, keyserver_id: &KeyserverId) -> Result<SharedCaller, CallError> {
        Err(CallError::UnknownKeyserver(keyserver_id.clone()))
    }

    async fn call_many(
        &self,
        endpoint: Endpoint,
        requests: KeyserverRequests,
        _options: CallOptions,
    ) -> Result<KeyserverResponses, CallError> {
        let keyserver_ids: Vec<_> = requests.keys().cloned().collect();
        self.requests.lock().await.push((endpoint, requests));
        let reply = self
            .replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(json!({})));
        let value = reply?;
        Ok(keyserver_ids.into_iter().map(|id| (id, value.clone())).collect())
    }
}

fn keyserver_auth(ctx: &Arc<ConnectionContext>) -> KeyserverAuth {
    KeyserverAuth::new(
        ctx.clone(),
        Arc::new(FakeIdentity::default()),
        Arc::new(FakeOlm::default()),
    )
}

fn inputs(cancel: CancelFlag) -> (KeyserverAuthInputs, mpsc::UnboundedReceiver<bool>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let inputs = KeyserverAuthInputs {
        auth_action_source: AuthActionSource::KeyserverAuthFromNative,
        set_in_progress: Arc::new(move |in_progress| {
            let _ = tx.send(in_progress);
        }),
        cancel,
        do_not_register: false,
    };
    (inputs, rx)
}

fn secondary() -> KeyserverId {
    KeyserverId::from(SECONDARY)
}

fn two_keyserver_context() -> Arc<ConnectionContext> {
    logged_in_context(config_for(&[
        (AUTHORITATIVE, "http://authoritative.test"),
        (SECONDARY, "http://secondary.test"),
    ]))
}

#[tokio::test]
async fn auth_request_carries_session_material() {
    let ctx = two_keyserver_context();
    ctx.store.dispatch(Action::SetDeviceToken {
        keyserver_id: KeyserverId::from(AUTHORITATIVE),
        device_token: Some("apns-token".to_string()),
    });
    let auth = keyserver_auth(&ctx);
    let endpoint = ScriptedAuthEndpoint::default();
    let (inputs, _in_progress) = inputs(CancelFlag::new());

    auth.authenticate(&secondary(), &inputs, &endpoint)
        .await
        .expect("auth");

    let requests = endpoint.requests.lock().await;
    assert_eq!(requests.len(), 1);
    let (called, by_keyserver) = &requests[0];
    assert_eq!(*called, Endpoint::KeyserverAuth);
    let request: KeyserverAuthRequest =
        serde_json::from_value(by_keyserver[&secondary()].clone()).expect("auth request");
    assert_eq!(request.user_id, "100");
    assert_eq!(request.device_id, "device-1");
    assert!(!request.do_not_register);
    assert_eq!(request.source, "KEYSERVER_AUTH_FROM_NATIVE");
    assert_eq!(
        request.device_token_update_request,
        Some(DeviceTokenUpdateRequest {
            device_token: "apns-token".to_string()
        })
    );
    assert_eq!(request.initial_content_encrypted_message, "content-initial-message");
    assert_eq!(request.initial_notifications_encrypted_message, "notif-initial-message");
    assert_eq!(request.platform_details, ctx.config.platform_details);
}

#[tokio::test]
async fn olm_session_creation_failure_is_retried_once() {
    let ctx = two_keyserver_context();
    let auth = keyserver_auth(&ctx);
    let endpoint = ScriptedAuthEndpoint::with_replies(vec![
        Err(CallError::server(OLM_SESSION_CREATION_FAILURE, None)),
        Ok(json!({})),
    ]);
    let (inputs, _in_progress) = inputs(CancelFlag::new());

    auth.authenticate_with_retry(&secondary(), &inputs, &endpoint)
        .await
        .expect("retry succeeds");

    assert_eq!(endpoint.requests.lock().await.len(), 2);
}

#[tokio::test]
async fn second_olm_session_creation_failure_propagates() {
    let ctx = two_keyserver_context();
    let auth = keyserver_auth(&ctx);
    let endpoint = ScriptedAuthEndpoint::with_replies(vec![
        Err(CallError::server(OLM_SESSION_CREATION_FAILURE, None)),
        Err(CallError::server(OLM_SESSION_CREATION_FAILURE, None)),
        Ok(json!({})),
    ]);
    let (inputs, _in_progress) = inputs(CancelFlag::new());

    let err = auth
        .authenticate_with_retry(&secondary(), &inputs, &endpoint)
        .await
        .expect_err("second failure propagates");

    assert!(err.has_message(OLM_SESSION_CREATION_FAILURE));
    assert_eq!(endpoint.requests.lock().await.len(), 2);
}

#[tokio::test]
async fn other_failures_are_not_retried() {
    let ctx = two_keyserver_context();
    let auth = keyserver_auth(&ctx);
    let endpoint =
        ScriptedAuthEndpoint::with_replies(vec![Err(CallError::server("internal_error", None))]);
    let (inputs, _in_progress) = inputs(CancelFlag::new());

    let err = auth
        .authenticate_with_retry(&secondary(), &inputs, &endpoint)
        .await
        .expect_err("failure propagates");

    assert!(err.has_message("internal_error"));
    assert_eq!(endpoint.requests.lock().await.len(), 1);
}

#[tokio::test]
async fn cancelled_attempt_skips_the_rpc_and_swallows_the_sentinel() {
    let ctx = two_keyserver_context();
    let auth = keyserver_auth(&ctx);
    let endpoint = ScriptedAuthEndpoint::default();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let (inputs, mut in_progress) = inputs(cancel);

    auth.authenticate(&secondary(), &inputs, &endpoint)
        .await
        .expect("cancellation is not an error");

    assert!(endpoint.requests.lock().await.is_empty());
    tokio::task::yield_now().await;
    assert!(in_progress.try_recv().is_err());
}

#[tokio::test]
async fn unsupported_client_version_records_a_connection_issue() {
    let ctx = two_keyserver_context();
    let auth = keyserver_auth(&ctx);
    let endpoint = ScriptedAuthEndpoint::with_replies(vec![Err(CallError::server(
        CLIENT_VERSION_UNSUPPORTED,
        None,
    ))]);
    let (inputs, _in_progress) = inputs(CancelFlag::new());

    auth.authenticate(&secondary(), &inputs, &endpoint)
        .await
        .expect_err("failure propagates");

    let issue = ctx.store.select(|s| {
        s.keyserver(&secondary())
            .and_then(|k| k.connection_issue)
    });
    assert_eq!(issue, Some(ConnectionIssue::ClientVersionUnsupported));
}

#[tokio::test(start_paused = true)]
async fn in_progress_is_lowered_only_after_the_cooldown() {
    let ctx = two_keyserver_context();
    let auth = keyserver_auth(&ctx);
    let endpoint = ScriptedAuthEndpoint::default();
    let (inputs, mut in_progress) = inputs(CancelFlag::new());

    auth.authenticate(&secondary(), &inputs, &endpoint)
        .await
        .expect("auth");

    let early = tokio::time::timeout(Duration::from_secs(59), in_progress.recv()).await;
    assert!(early.is_err(), "cooldown ended early");
    assert_eq!(in_progress.recv().await, Some(false));
}
