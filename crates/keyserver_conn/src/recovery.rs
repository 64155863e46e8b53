use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use shared::domain::KeyserverId;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    auth::{InProgressSetter, KeyserverAuth, KeyserverAuthInputs},
    cancel::CancelFlag,
    context::ConnectionContext,
    error::CallError,
    executor::{BoundSession, KeyserverCaller, SessionHooks, SharedCaller},
    fanout::{CallKeyserverEndpoint, SingleKeyserverFanOut},
    session::{
        generic_cookie_invalidation, set_new_session, ClientSessionChange, PreRequestUserState,
        RecoveryActionSource,
    },
    store::{Action, StateStoreExt},
};

type Waiters<T> = HashMap<KeyserverId, Vec<oneshot::Sender<Option<T>>>>;

/// At most one attempt per keyserver; callers arriving while one runs get its
/// outcome instead of starting another.
pub struct RecoveryCoordinator<T: Clone> {
    in_flight: Mutex<Waiters<T>>,
}

impl<T: Clone> Default for RecoveryCoordinator<T> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> RecoveryCoordinator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self, keyserver_id: &KeyserverId) -> bool {
        self.lock().contains_key(keyserver_id)
    }

    pub async fn wait_if_in_flight(&self, keyserver_id: &KeyserverId) -> Option<Option<T>> {
        let receiver = {
            let mut in_flight = self.lock();
            let waiters = in_flight.get_mut(keyserver_id)?;
            let (sender, receiver) = oneshot::channel();
            waiters.push(sender);
            receiver
        };
        Some(receiver.await.unwrap_or(None))
    }

    /// Joins the running attempt for `keyserver_id`, or runs `attempt` as the
    /// new one. Every waiter is released with the attempt's value, or with
    /// `None` when it fails or is dropped. The error only reaches the caller
    /// that ran the attempt.
    pub async fn run<F, E>(&self, keyserver_id: &KeyserverId, attempt: F) -> Result<Option<T>, E>
    where
        F: Future<Output = Result<Option<T>, E>>,
    {
        let joined = {
            let mut in_flight = self.lock();
            match in_flight.get_mut(keyserver_id) {
                Some(waiters) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    Some(receiver)
                }
                None => {
                    in_flight.insert(keyserver_id.clone(), Vec::new());
                    None
                }
            }
        };
        if let Some(receiver) = joined {
            return Ok(receiver.await.unwrap_or(None));
        }

        let mut guard = ReleaseGuard {
            coordinator: self,
            keyserver_id,
            released: false,
        };
        let result = attempt.await;
        guard.release(result.as_ref().ok().cloned().flatten());
        result
    }

    fn release(&self, keyserver_id: &KeyserverId, outcome: Option<T>) {
        let waiters = self.lock().remove(keyserver_id).unwrap_or_default();
        debug!(keyserver_id = %keyserver_id, waiters = waiters.len(), "releasing recovery waiters");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, Waiters<T>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ReleaseGuard<'a, T: Clone> {
    coordinator: &'a RecoveryCoordinator<T>,
    keyserver_id: &'a KeyserverId,
    released: bool,
}

impl<T: Clone> ReleaseGuard<'_, T> {
    fn release(&mut self, outcome: Option<T>) {
        self.released = true;
        self.coordinator.release(self.keyserver_id, outcome);
    }
}

impl<T: Clone> Drop for ReleaseGuard<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            self.coordinator.release(self.keyserver_id, None);
        }
    }
}

#[async_trait]
pub trait NativeCredentialsResolver: Send + Sync {
    async fn resolve(
        &self,
        keyserver_id: &KeyserverId,
        source: RecoveryActionSource,
        caller: &dyn CallKeyserverEndpoint,
        cancel: &CancelFlag,
    ) -> anyhow::Result<()>;
}

pub struct SessionRecovery {
    ctx: Arc<ConnectionContext>,
    auth: Option<Arc<KeyserverAuth>>,
    native: Option<Arc<dyn NativeCredentialsResolver>>,
}

impl SessionRecovery {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        auth: Option<Arc<KeyserverAuth>>,
        native: Option<Arc<dyn NativeCredentialsResolver>>,
    ) -> Self {
        Self { ctx, auth, native }
    }

    pub fn can_resolve_invalidation(&self) -> bool {
        (self.ctx.config.using_services_access_token && self.auth.is_some())
            || self.native.is_some()
    }

    pub async fn resolve_session_invalidation(
        &self,
        keyserver_id: &KeyserverId,
        cookie: Option<String>,
        url_prefix: String,
        source: RecoveryActionSource,
        pre_request: PreRequestUserState,
        set_in_progress: InProgressSetter,
        cancel: &CancelFlag,
    ) -> Result<Option<ClientSessionChange>, CallError> {
        let hooks = Arc::new(CapturingHooks {
            ctx: self.ctx.clone(),
            keyserver_id: keyserver_id.clone(),
            pre_request,
            source,
            captured: Mutex::new(None),
        });
        let session = BoundSession {
            keyserver_id: keyserver_id.clone(),
            cookie,
            session_id: None,
            url_prefix,
            is_socket_connected: false,
            last_communicated_platform_details: None,
            current_user_info: None,
        };
        let caller: SharedCaller = Arc::new(KeyserverCaller::new(
            self.ctx.clone(),
            session,
            None,
            hooks.clone(),
        ));
        let fan_out = SingleKeyserverFanOut::new(keyserver_id.clone(), caller);
        self.run_recovery_action(keyserver_id, source, &fan_out, set_in_progress, cancel)
            .await?;
        Ok(hooks.take())
    }

    /// Recovery log-in for one keyserver. Returns the new session when it is a
    /// logged-in one; otherwise the session is invalidated (logging the user
    /// out if the keyserver is the authoritative one) and `None` is returned.
    /// Errors also invalidate, and propagate unless `cancel` was raised.
    pub async fn recovery_log_in(
        &self,
        keyserver_id: &KeyserverId,
        source: RecoveryActionSource,
        cookie_override: Option<String>,
        set_in_progress: InProgressSetter,
        cancel: &CancelFlag,
    ) -> Result<Option<ClientSessionChange>, CallError> {
        let (pre_request, session) = self.ctx.store.select(|state| {
            (
                PreRequestUserState::capture(state, keyserver_id),
                state.keyserver(keyserver_id).cloned(),
            )
        });
        let session = session.ok_or_else(|| CallError::UnknownKeyserver(keyserver_id.clone()))?;
        let cookie = cookie_override.or(session.cookie);

        info!(keyserver_id = %keyserver_id, source = source.as_str(), "starting session recovery");
        let result = self
            .resolve_session_invalidation(
                keyserver_id,
                cookie,
                session.url_prefix,
                source,
                pre_request.clone(),
                set_in_progress,
                cancel,
            )
            .await;
        match result {
            Ok(Some(change)) if change.is_user_session() => {
                info!(keyserver_id = %keyserver_id, "session recovered");
                Ok(Some(change))
            }
            Ok(change) => {
                let change = change.unwrap_or_else(generic_cookie_invalidation);
                self.invalidate(keyserver_id, source, change, pre_request, cancel);
                Ok(None)
            }
            Err(_) if cancel.is_cancelled() => Ok(None),
            Err(err) => {
                warn!(keyserver_id = %keyserver_id, error = %err, "error during recovery log-in");
                self.invalidate(
                    keyserver_id,
                    source,
                    generic_cookie_invalidation(),
                    pre_request,
                    cancel,
                );
                Err(err)
            }
        }
    }

    async fn run_recovery_action(
        &self,
        keyserver_id: &KeyserverId,
        source: RecoveryActionSource,
        fan_out: &SingleKeyserverFanOut,
        set_in_progress: InProgressSetter,
        cancel: &CancelFlag,
    ) -> Result<(), CallError> {
        if self.ctx.config.using_services_access_token {
            if let Some(auth) = &self.auth {
                let inputs = KeyserverAuthInputs {
                    auth_action_source: source.into(),
                    set_in_progress,
                    cancel: cancel.clone(),
                    do_not_register: true,
                };
                if let Err(err) = auth.authenticate(keyserver_id, &inputs, fan_out).await {
                    warn!(
                        keyserver_id = %keyserver_id,
                        error = %err,
                        "keyserver auth during session recovery failed"
                    );
                }
                return Ok(());
            }
        }
        match &self.native {
            Some(native) => {
                debug!(keyserver_id = %keyserver_id, "recovering with native credentials");
                native.resolve(keyserver_id, source, fan_out, cancel).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn invalidate(
        &self,
        keyserver_id: &KeyserverId,
        source: RecoveryActionSource,
        change: ClientSessionChange,
        pre_request: PreRequestUserState,
        cancel: &CancelFlag,
    ) {
        if cancel.is_cancelled() {
            return;
        }
        let store = self.ctx.store.as_ref();
        set_new_session(store, change, Some(pre_request), None, Some(source), keyserver_id);
        let config = &self.ctx.config;
        if config.relying_on_authoritative_keyserver && config.is_authoritative(keyserver_id) {
            info!(keyserver_id = %keyserver_id, "recovery failed on authoritative keyserver, logging out");
            store.dispatch(Action::LogOut);
        }
    }
}

struct CapturingHooks {
    ctx: Arc<ConnectionContext>,
    keyserver_id: KeyserverId,
    pre_request: PreRequestUserState,
    source: RecoveryActionSource,
    captured: Mutex<Option<ClientSessionChange>>,
}

impl CapturingHooks {
    fn take(&self) -> Option<ClientSessionChange> {
        self.captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl SessionHooks for CapturingHooks {
    fn set_new_session(&self, change: ClientSessionChange, error: Option<&str>) {
        *self
            .captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(change.clone());
        set_new_session(
            self.ctx.store.as_ref(),
            change,
            Some(self.pre_request.clone()),
            error,
            Some(self.source),
            &self.keyserver_id,
        );
    }

    async fn wait_if_invalidated(&self) -> Option<SharedCaller> {
        None
    }

    async fn recover_invalidation(
        &self,
        _change: ClientSessionChange,
        _error: Option<&str>,
    ) -> Result<Option<SharedCaller>, CallError> {
        Ok(None)
    }
}

#[cfg(test)]
#[path = "tests/recovery_tests.rs"]
mod tests;
