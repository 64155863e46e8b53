use std::sync::Arc;

use futures::FutureExt;
use shared::domain::KeyserverId;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    auth::{InProgressSetter, KeyserverAuth, KeyserverAuthInputs},
    cancel::CancelFlag,
    config::ConnectionConfig,
    fifo::SequentialResolver,
    provider::KeyserverConnections,
    session::{is_user_cookie, AuthActionSource, RecoveryActionSource},
    store::{Action, ConnectionState},
};

/// Changing any of these restarts a running auth attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthIdentity {
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    pub device_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorInputs {
    pub active_session_recovery: Option<RecoveryActionSource>,
    pub has_current_user_info: bool,
    pub logged_in_to_keyserver: bool,
    pub has_access_token: bool,
    pub using_services_access_token: bool,
    pub is_authoritative: bool,
    pub identity: AuthIdentity,
}

impl SupervisorInputs {
    pub fn from_state(
        state: &ConnectionState,
        keyserver_id: &KeyserverId,
        config: &ConnectionConfig,
    ) -> Self {
        let session = state.keyserver(keyserver_id);
        Self {
            active_session_recovery: session.and_then(|s| s.active_session_recovery),
            has_current_user_info: state.has_current_user_info(),
            logged_in_to_keyserver: state.is_logged_in_to_keyserver(keyserver_id),
            has_access_token: state.services_access_token.is_some(),
            using_services_access_token: config.using_services_access_token,
            is_authoritative: config.is_authoritative(keyserver_id),
            identity: AuthIdentity {
                user_id: state
                    .current_user_info
                    .as_ref()
                    .and_then(|info| info.id())
                    .map(str::to_string),
                access_token: state.services_access_token.clone(),
                device_token: session.and_then(|s| s.device_token.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Authenticating { identity: AuthIdentity },
    Recovering { source: RecoveryActionSource },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Start {
    Auth(AuthIdentity),
    Recovery(RecoveryActionSource),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    pub cancel_auth: bool,
    pub cancel_recovery: bool,
    pub start: Option<Start>,
}

/// One evaluation step. `in_progress` stays raised through the cooldown that
/// follows a finished auth attempt; cancelling an attempt lowers it.
pub fn decide(inputs: &SupervisorInputs, phase: &Phase, in_progress: bool) -> Decision {
    let mut decision = Decision::default();
    let authenticating = matches!(phase, Phase::Authenticating { .. });
    let recovering = matches!(phase, Phase::Recovering { .. });

    let can_initiate_recovery = inputs.has_current_user_info && inputs.logged_in_to_keyserver;
    if let (Some(source), true) = (inputs.active_session_recovery, can_initiate_recovery) {
        decision.cancel_auth = authenticating;
        if recovering {
            return decision;
        }
        if !in_progress || decision.cancel_auth {
            decision.start = Some(Start::Recovery(source));
        }
        return decision;
    }

    decision.cancel_recovery = recovering;
    if authenticating && (!inputs.has_access_token || !inputs.has_current_user_info) {
        decision.cancel_auth = true;
    }
    if !inputs.using_services_access_token
        || inputs.logged_in_to_keyserver
        || !inputs.has_access_token
        || !inputs.has_current_user_info
        || inputs.is_authoritative
    {
        return decision;
    }

    if let Phase::Authenticating { identity } = phase {
        if *identity != inputs.identity {
            decision.cancel_auth = true;
        }
    }
    let still_running = authenticating && !decision.cancel_auth;
    let in_progress = in_progress && !decision.cancel_auth && !decision.cancel_recovery;
    if !still_running && !in_progress {
        decision.start = Some(Start::Auth(inputs.identity.clone()));
    }
    decision
}

enum Event {
    InProgress { generation: u64, in_progress: bool },
    Finished { generation: u64 },
    BackgroundFailure(anyhow::Error),
}

struct Attempt {
    phase: Phase,
    cancel: CancelFlag,
    generation: u64,
}

struct HandlerState {
    attempt: Option<Attempt>,
    in_progress: bool,
    generation: u64,
    live_generation: Option<u64>,
    prev_cookie: Option<String>,
    had_connection_issue: bool,
}

impl HandlerState {
    fn phase(&self) -> Phase {
        self.attempt
            .as_ref()
            .map_or(Phase::Idle, |attempt| attempt.phase.clone())
    }

    fn cancel(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            debug!(generation = attempt.generation, "cancelling attempt");
            attempt.cancel.cancel();
            self.in_progress = false;
            self.live_generation = None;
        }
    }

    fn begin(&mut self, phase: Phase) -> (CancelFlag, u64) {
        self.generation += 1;
        let cancel = CancelFlag::new();
        self.attempt = Some(Attempt {
            phase,
            cancel: cancel.clone(),
            generation: self.generation,
        });
        self.in_progress = true;
        self.live_generation = Some(self.generation);
        (cancel, self.generation)
    }
}

pub struct KeyserverConnectionHandler {
    keyserver_id: KeyserverId,
    connections: Arc<KeyserverConnections>,
    auth: Arc<KeyserverAuth>,
    auth_source: AuthActionSource,
}

impl KeyserverConnectionHandler {
    pub fn new(
        keyserver_id: KeyserverId,
        connections: Arc<KeyserverConnections>,
        auth: Arc<KeyserverAuth>,
        auth_source: AuthActionSource,
    ) -> Self {
        Self {
            keyserver_id,
            connections,
            auth,
            auth_source,
        }
    }

    pub fn spawn(self) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let ctx = self.connections.context().clone();
        let mut states = ctx.store.subscribe();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let resolver = SequentialResolver::spawn();

        let mut handler = {
            let initial = states.borrow();
            HandlerState {
                attempt: None,
                in_progress: false,
                generation: 0,
                live_generation: None,
                prev_cookie: initial
                    .keyserver(&self.keyserver_id)
                    .and_then(|s| s.cookie.clone()),
                had_connection_issue: false,
            }
        };
        info!(keyserver_id = %self.keyserver_id, "connection handler started");

        let outcome = loop {
            let state = states.borrow_and_update().clone();
            self.observe(&state, &mut handler, &events_tx, &resolver);

            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                Some(event) = events.recv() => {
                    if let Err(err) = self.handle_event(event, &mut handler) {
                        break Err(err);
                    }
                }
            }
        };

        handler.cancel();
        resolver.close().await;
        info!(keyserver_id = %self.keyserver_id, "connection handler stopped");
        outcome
    }

    fn handle_event(&self, event: Event, handler: &mut HandlerState) -> anyhow::Result<()> {
        match event {
            Event::InProgress {
                generation,
                in_progress,
            } => {
                if handler.live_generation == Some(generation) {
                    handler.in_progress = in_progress;
                }
            }
            Event::Finished { generation } => {
                let current = handler.attempt.as_ref().map(|a| a.generation);
                if current != Some(generation) {
                    return Ok(());
                }
                match handler.attempt.take().map(|attempt| attempt.phase) {
                    Some(Phase::Recovering { .. }) => handler.in_progress = false,
                    // The auth cooldown lowers the flag on its own.
                    Some(Phase::Authenticating { .. } | Phase::Idle) | None => {}
                }
            }
            Event::BackgroundFailure(err) => {
                let policy = self.connections.context().config.background_failure_policy;
                policy.report("notifications session reassignment failed", err)?;
            }
        }
        Ok(())
    }

    fn observe(
        &self,
        state: &ConnectionState,
        handler: &mut HandlerState,
        events: &mpsc::UnboundedSender<Event>,
        resolver: &SequentialResolver,
    ) {
        let ctx = self.connections.context();
        let config = &ctx.config;
        let relying_here = config.relying_on_authoritative_keyserver
            && config.is_authoritative(&self.keyserver_id);
        let session = state.keyserver(&self.keyserver_id);

        let has_connection_issue = session.is_some_and(|s| s.connection_issue.is_some());
        if has_connection_issue && !handler.had_connection_issue && relying_here {
            info!(keyserver_id = %self.keyserver_id, "logging out due to connection issue");
            ctx.store.dispatch(Action::LogOut);
        }
        handler.had_connection_issue = has_connection_issue;

        let cookie = session.and_then(|s| s.cookie.clone());
        if cookie != handler.prev_cookie {
            let prev_cookie = std::mem::replace(&mut handler.prev_cookie, cookie.clone());
            if let Some(new_cookie) = cookie.filter(|c| is_user_cookie(c)) {
                self.reassign_notifications_session(prev_cookie, new_cookie, events, resolver);
            }
        }

        let inputs = SupervisorInputs::from_state(state, &self.keyserver_id, config);
        let decision = decide(&inputs, &handler.phase(), handler.in_progress);
        if decision.cancel_auth || decision.cancel_recovery {
            handler.cancel();
        }
        match decision.start {
            Some(Start::Recovery(source)) => {
                info!(keyserver_id = %self.keyserver_id, source = source.as_str(), "session recovery initiated");
                let (cancel, generation) = handler.begin(Phase::Recovering { source });
                self.start_recovery(source, cancel, generation, events.clone());
            }
            Some(Start::Auth(identity)) => {
                info!(keyserver_id = %self.keyserver_id, "starting keyserver auth");
                let (cancel, generation) = handler.begin(Phase::Authenticating { identity });
                self.start_auth(cancel, generation, events.clone());
            }
            None => {}
        }
    }

    fn reassign_notifications_session(
        &self,
        prev_cookie: Option<String>,
        new_cookie: String,
        events: &mpsc::UnboundedSender<Event>,
        resolver: &SequentialResolver,
    ) {
        let olm = self.auth.olm().clone();
        let keyserver_id = self.keyserver_id.clone();
        let events = events.clone();
        let job = async move {
            debug!(keyserver_id = %keyserver_id, "reassigning notifications session");
            if let Err(err) = olm
                .reassign_notifications_session(prev_cookie.as_deref(), &new_cookie, &keyserver_id)
                .await
            {
                let _ = events.send(Event::BackgroundFailure(err));
            }
        };
        if !resolver.enqueue(job.boxed()) {
            warn!(keyserver_id = %self.keyserver_id, "sequential resolver is gone");
        }
    }

    fn in_progress_setter(generation: u64, events: mpsc::UnboundedSender<Event>) -> InProgressSetter {
        Arc::new(move |in_progress| {
            let _ = events.send(Event::InProgress {
                generation,
                in_progress,
            });
        })
    }

    fn start_auth(&self, cancel: CancelFlag, generation: u64, events: mpsc::UnboundedSender<Event>) {
        let inputs = KeyserverAuthInputs {
            auth_action_source: self.auth_source,
            set_in_progress: Self::in_progress_setter(generation, events.clone()),
            cancel,
            do_not_register: false,
        };
        let keyserver_id = self.keyserver_id.clone();
        let connections = self.connections.clone();
        let auth = self.auth.clone();
        tokio::spawn(async move {
            let result = auth
                .authenticate_with_retry(&keyserver_id, &inputs, connections.as_ref())
                .await;
            if result.is_err() {
                let ctx = connections.context();
                let config = &ctx.config;
                let data_loaded = ctx.store.snapshot().data_loaded;
                if !data_loaded
                    && config.relying_on_authoritative_keyserver
                    && config.is_authoritative(&keyserver_id)
                {
                    info!(keyserver_id = %keyserver_id, "auth failed before data loaded, logging out");
                    ctx.store.dispatch(Action::LogOut);
                }
            }
            let _ = events.send(Event::Finished { generation });
        });
    }

    fn start_recovery(
        &self,
        source: RecoveryActionSource,
        cancel: CancelFlag,
        generation: u64,
        events: mpsc::UnboundedSender<Event>,
    ) {
        let keyserver_id = self.keyserver_id.clone();
        let connections = self.connections.clone();
        let set_in_progress = Self::in_progress_setter(generation, events.clone());
        tokio::spawn(async move {
            let result = connections
                .recovery()
                .recovery_log_in(&keyserver_id, source, None, set_in_progress, &cancel)
                .await;
            if let Err(err) = result {
                warn!(keyserver_id = %keyserver_id, error = %err, "session recovery failed");
            }
            let _ = events.send(Event::Finished { generation });
        });
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
