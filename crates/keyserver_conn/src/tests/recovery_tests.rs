use super::*;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use serde_json::json;
use shared::domain::CurrentUserInfo;

use crate::{
    config::ConnectionConfig,
    endpoints::Endpoint,
    executor::CallOptions,
    fanout::KeyserverRequests,
    store::StateStore,
    test_support::{
        config_for, logged_in_context, spawn_keyserver, FakeIdentity, FakeOlm, Reply,
        AUTHORITATIVE, SECONDARY,
    },
};

#[tokio::test]
async fn concurrent_callers_share_one_attempt() {
    let coordinator = Arc::new(RecoveryCoordinator::<u32>::new());
    let attempts = Arc::new(AtomicUsize::new(0));
    let keyserver_id = KeyserverId::from(AUTHORITATIVE);

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let coordinator = coordinator.clone();
        let attempts = attempts.clone();
        let keyserver_id = keyserver_id.clone();
        tasks.push(tokio::spawn(async move {
            coordinator
                .run(&keyserver_id, async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, CallError>(Some(7))
                })
                .await
        }));
    }

    for task in tasks {
        assert_eq!(task.await.expect("join").expect("outcome"), Some(7));
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(!coordinator.is_in_flight(&keyserver_id));
}

#[tokio::test]
async fn failed_attempt_releases_waiters_with_none() {
    let coordinator = Arc::new(RecoveryCoordinator::<u32>::new());
    let keyserver_id = KeyserverId::from(AUTHORITATIVE);

    let initiator = {
        let coordinator = coordinator.clone();
        let keyserver_id = keyserver_id.clone();
        tokio::spawn(async move {
            coordinator
                .run(&keyserver_id, async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<Option<u32>, _>(CallError::server("internal_error", None))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(coordinator.is_in_flight(&keyserver_id));

    let waiter = coordinator.wait_if_in_flight(&keyserver_id).await;

    assert_eq!(waiter, Some(None));
    let err = initiator.await.expect("join").expect_err("initiator sees the error");
    assert!(err.has_message("internal_error"));
    assert!(!coordinator.is_in_flight(&keyserver_id));
}

#[tokio::test]
async fn dropped_attempt_still_releases_waiters() {
    let coordinator = Arc::new(RecoveryCoordinator::<u32>::new());
    let keyserver_id = KeyserverId::from(AUTHORITATIVE);

    let initiator = {
        let coordinator = coordinator.clone();
        let keyserver_id = keyserver_id.clone();
        tokio::spawn(async move {
            coordinator
                .run(&keyserver_id, futures::future::pending::<Result<Option<u32>, CallError>>())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let waiter = {
        let coordinator = coordinator.clone();
        let keyserver_id = keyserver_id.clone();
        tokio::spawn(async move { coordinator.wait_if_in_flight(&keyserver_id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    initiator.abort();

    let released = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter released")
        .expect("join");
    assert_eq!(released, Some(None));
    assert!(!coordinator.is_in_flight(&keyserver_id));
}

#[tokio::test]
async fn idle_keyserver_has_nothing_to_wait_for() {
    let coordinator = RecoveryCoordinator::<u32>::new();
    assert_eq!(
        coordinator
            .wait_if_in_flight(&KeyserverId::from(AUTHORITATIVE))
            .await,
        None
    );
}

#[derive(Default)]
struct CredentialsLogIn {
    resolutions: AtomicUsize,
    delay: Duration,
    fail: bool,
}

#[async_trait]
impl NativeCredentialsResolver for CredentialsLogIn {
    async fn resolve(
        &self,
        keyserver_id: &KeyserverId,
        _source: RecoveryActionSource,
        caller: &dyn CallKeyserverEndpoint,
        _cancel: &CancelFlag,
    ) -> anyhow::Result<()> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            anyhow::bail!("stored credentials rejected");
        }
        let requests = KeyserverRequests::from([(
            keyserver_id.clone(),
            json!({ "username": "ashoat", "password": "stored" }),
        )]);
        caller
            .call_many(Endpoint::LogIn, requests, CallOptions::default())
            .await?;
        Ok(())
    }
}

fn native_only(config: &mut ConnectionConfig) {
    config.using_services_access_token = false;
}

fn log_in_success(cookie: &str) -> Reply {
    Reply::Json(json!({
        "cookieChange": { "cookieInvalidated": false, "cookie": cookie, "sessionID": "session-9" },
        "currentUserInfo": { "id": "100", "username": "ashoat" },
    }))
}

#[tokio::test]
async fn recovery_log_in_returns_the_new_user_session() {
    let keyserver = spawn_keyserver().await;
    keyserver.reply("log_in", log_in_success("user=100:fresh")).await;
    let mut config = config_for(&[(AUTHORITATIVE, &keyserver.url)]);
    native_only(&mut config);
    let ctx = logged_in_context(config);
    let resolver = Arc::new(CredentialsLogIn::default());
    let recovery = SessionRecovery::new(ctx.clone(), None, Some(resolver.clone()));
    let keyserver_id = KeyserverId::from(AUTHORITATIVE);

    let change = recovery
        .recovery_log_in(
            &keyserver_id,
            RecoveryActionSource::CookieInvalidationResolutionAttempt,
            Some("anonymous=3:x".to_string()),
            Arc::new(|_| {}),
            &CancelFlag::new(),
        )
        .await
        .expect("recovery")
        .expect("user session");

    assert_eq!(change.cookie(), Some("user=100:fresh"));
    let requests = keyserver.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body["cookie"], json!("anonymous=3:x"));
    let stored = ctx.store.select(|s| s.keyserver(&keyserver_id).cloned()).expect("session");
    assert_eq!(stored.cookie.as_deref(), Some("user=100:fresh"));
    assert_eq!(stored.session_id.as_deref(), Some("session-9"));
}

#[tokio::test]
async fn anonymous_result_invalidates_the_session() {
    let keyserver = spawn_keyserver().await;
    keyserver
        .reply(
            "log_in",
            Reply::Json(json!({
                "cookieChange": { "cookieInvalidated": false, "cookie": "anonymous=4:y" },
            })),
        )
        .await;
    let mut config = config_for(&[(AUTHORITATIVE, "http://unused.test"), (SECONDARY, &keyserver.url)]);
    native_only(&mut config);
    let ctx = logged_in_context(config);
    let recovery = SessionRecovery::new(ctx.clone(), None, Some(Arc::new(CredentialsLogIn::default())));
    let keyserver_id = KeyserverId::from(SECONDARY);

    let change = recovery
        .recovery_log_in(
            &keyserver_id,
            RecoveryActionSource::SocketNotLoggedIn,
            None,
            Arc::new(|_| {}),
            &CancelFlag::new(),
        )
        .await
        .expect("recovery completes");

    assert_eq!(change, None);
    let cookie = ctx
        .store
        .select(|s| s.keyserver(&keyserver_id).and_then(|k| k.cookie.clone()));
    assert_eq!(cookie.as_deref(), Some("anonymous=4:y"));
    assert!(ctx.store.snapshot().has_current_user_info());
}

#[tokio::test]
async fn failed_recovery_on_authoritative_keyserver_logs_out_and_propagates() {
    let mut config = config_for(&[(AUTHORITATIVE, "http://unused.test")]);
    native_only(&mut config);
    let ctx = logged_in_context(config);
    let resolver = Arc::new(CredentialsLogIn {
        fail: true,
        ..CredentialsLogIn::default()
    });
    let recovery = SessionRecovery::new(ctx.clone(), None, Some(resolver));

    let err = recovery
        .recovery_log_in(
            &KeyserverId::from(AUTHORITATIVE),
            RecoveryActionSource::SocketNotLoggedIn,
            None,
            Arc::new(|_| {}),
            &CancelFlag::new(),
        )
        .await
        .expect_err("error propagates");

    assert!(err.to_string().contains("stored credentials rejected"));
    assert_eq!(
        ctx.store.snapshot().current_user_info,
        Some(CurrentUserInfo::anonymous())
    );
}

#[tokio::test]
async fn cancelled_recovery_swallows_errors_and_leaves_the_store_alone() {
    let mut config = config_for(&[(AUTHORITATIVE, "http://unused.test")]);
    native_only(&mut config);
    let ctx = logged_in_context(config);
    let recovery = SessionRecovery::new(
        ctx.clone(),
        None,
        Some(Arc::new(CredentialsLogIn {
            fail: true,
            ..CredentialsLogIn::default()
        })),
    );
    let before = ctx.store.snapshot();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let outcome = recovery
        .recovery_log_in(
            &KeyserverId::from(AUTHORITATIVE),
            RecoveryActionSource::SocketNotLoggedIn,
            None,
            Arc::new(|_| {}),
            &cancel,
        )
        .await
        .expect("cancelled recovery does not fail");

    assert_eq!(outcome, None);
    assert_eq!(ctx.store.snapshot(), before);
}

#[tokio::test]
async fn keyserver_auth_failure_during_recovery_is_logged_not_raised() {
    let keyserver = spawn_keyserver().await;
    keyserver
        .reply("keyserver_auth", Reply::Json(json!({ "error": "internal_error" })))
        .await;
    let ctx = logged_in_context(config_for(&[
        (AUTHORITATIVE, "http://unused.test"),
        (SECONDARY, &keyserver.url),
    ]));
    let auth = Arc::new(KeyserverAuth::new(
        ctx.clone(),
        Arc::new(FakeIdentity::default()),
        Arc::new(FakeOlm::default()),
    ));
    let recovery = SessionRecovery::new(ctx.clone(), Some(auth), None);
    let keyserver_id = KeyserverId::from(SECONDARY);

    let outcome = recovery
        .recovery_log_in(
            &keyserver_id,
            RecoveryActionSource::SocketAuthErrorResolutionAttempt,
            None,
            Arc::new(|_| {}),
            &CancelFlag::new(),
        )
        .await
        .expect("auth failure is swallowed");

    assert_eq!(outcome, None);
    let request = &keyserver.requests().await[0];
    assert_eq!(request.endpoint, "keyserver_auth");
    assert_eq!(request.body["input"]["doNotRegister"], json!(true));
    assert_eq!(
        request.body["input"]["source"],
        json!("SOCKET_AUTH_ERROR_RESOLUTION_ATTEMPT")
    );
    let cookie = ctx
        .store
        .select(|s| s.keyserver(&keyserver_id).and_then(|k| k.cookie.clone()));
    assert_eq!(cookie, None);
}

#[test]
fn resolution_needs_services_auth_or_native_credentials() {
    let ctx = logged_in_context(config_for(&[(AUTHORITATIVE, "http://unused.test")]));
    let auth = Arc::new(KeyserverAuth::new(
        ctx.clone(),
        Arc::new(FakeIdentity::default()),
        Arc::new(FakeOlm::default()),
    ));
    assert!(SessionRecovery::new(ctx.clone(), Some(auth.clone()), None).can_resolve_invalidation());
    assert!(!SessionRecovery::new(ctx.clone(), None, None).can_resolve_invalidation());
    assert!(SessionRecovery::new(ctx, None, Some(Arc::new(CredentialsLogIn::default())))
        .can_resolve_invalidation());

    let mut config = config_for(&[(AUTHORITATIVE, "http://unused.test")]);
    native_only(&mut config);
    let ctx = logged_in_context(config);
    assert!(!SessionRecovery::new(ctx, Some(auth), None).can_resolve_invalidation());
}
