use std::sync::Arc;

use anyhow::anyhow;
use shared::{
    domain::KeyserverId,
    error::{CLIENT_VERSION_UNSUPPORTED, OLM_SESSION_CREATION_FAILURE},
    protocol::{DeviceTokenUpdateRequest, KeyserverAuthRequest},
};
use tracing::{debug, info, warn};

use crate::{
    cancel::CancelFlag,
    context::ConnectionContext,
    endpoints::Endpoint,
    error::CallError,
    executor::CallOptions,
    fanout::{CallKeyserverEndpoint, KeyserverRequests},
    identity::{IdentityClient, OlmApi},
    session::AuthActionSource,
    store::{Action, ConnectionIssue, StateStoreExt},
};

pub type InProgressSetter = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone)]
pub struct KeyserverAuthInputs {
    pub auth_action_source: AuthActionSource,
    pub set_in_progress: InProgressSetter,
    pub cancel: CancelFlag,
    pub do_not_register: bool,
}

pub struct KeyserverAuth {
    ctx: Arc<ConnectionContext>,
    identity: Arc<dyn IdentityClient>,
    olm: Arc<dyn OlmApi>,
}

impl KeyserverAuth {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        identity: Arc<dyn IdentityClient>,
        olm: Arc<dyn OlmApi>,
    ) -> Self {
        Self { ctx, identity, olm }
    }

    pub fn olm(&self) -> &Arc<dyn OlmApi> {
        &self.olm
    }

    /// Like [`Self::authenticate`], but retries once when the keyserver could
    /// not create an olm session, which happens when it was vended a stale
    /// one-time key.
    pub async fn authenticate_with_retry(
        &self,
        keyserver_id: &KeyserverId,
        inputs: &KeyserverAuthInputs,
        caller: &dyn CallKeyserverEndpoint,
    ) -> Result<(), CallError> {
        match self.authenticate(keyserver_id, inputs, caller).await {
            Err(err) if err.has_message(OLM_SESSION_CREATION_FAILURE) => {
                warn!(keyserver_id = %keyserver_id, "olm session creation failed, retrying auth");
                self.authenticate(keyserver_id, inputs, caller).await
            }
            result => result,
        }
    }

    pub async fn authenticate(
        &self,
        keyserver_id: &KeyserverId,
        inputs: &KeyserverAuthInputs,
        caller: &dyn CallKeyserverEndpoint,
    ) -> Result<(), CallError> {
        let result = self.attempt(keyserver_id, inputs, caller).await;
        if !inputs.cancel.is_cancelled() {
            let set_in_progress = inputs.set_in_progress.clone();
            let delay = self.ctx.config.auth_retry_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                set_in_progress(false);
            });
        }
        match result {
            Ok(()) => Ok(()),
            Err(_) if inputs.cancel.is_cancelled() => {
                info!(keyserver_id = %keyserver_id, "keyserver auth cancelled");
                Ok(())
            }
            Err(err) => {
                warn!(keyserver_id = %keyserver_id, error = %err, "keyserver auth failed");
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        keyserver_id: &KeyserverId,
        inputs: &KeyserverAuthInputs,
        caller: &dyn CallKeyserverEndpoint,
    ) -> Result<(), CallError> {
        debug!(keyserver_id = %keyserver_id, "fetching keyserver keys");
        let (keys, ()) = tokio::try_join!(
            self.identity.get_keyserver_keys(keyserver_id),
            self.olm.initialize_crypto_account(),
        )?;
        if inputs.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let authoritative_id = &self.ctx.config.authoritative_keyserver_id;
        let (cookie, device_token) = self.ctx.store.select(|state| {
            let session = state.keyserver(keyserver_id);
            let device_token = session
                .and_then(|s| s.device_token.clone())
                .or_else(|| state.keyserver(authoritative_id)?.device_token.clone());
            (session.and_then(|s| s.cookie.clone()), device_token)
        });

        let blob = &keys.identity_keys_blob;
        let (notifications_message, content_session, metadata) = tokio::try_join!(
            self.olm.notifications_session_creator(
                cookie.as_deref(),
                &blob.notification_identity_public_keys,
                &keys.notif_initialization_info,
                keyserver_id,
            ),
            self.olm.content_outbound_session_creator(
                &blob.primary_identity_public_keys,
                &keys.content_initialization_info,
            ),
            self.identity.get_auth_metadata(),
        )?;
        let user_id = metadata
            .user_id
            .ok_or_else(|| anyhow!("auth metadata is missing a user ID"))?;
        let device_id = metadata
            .device_id
            .ok_or_else(|| anyhow!("auth metadata is missing a device ID"))?;
        if inputs.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let request = KeyserverAuthRequest {
            user_id,
            device_id,
            do_not_register: inputs.do_not_register,
            source: inputs.auth_action_source.as_str().to_string(),
            device_token_update_request: device_token
                .map(|device_token| DeviceTokenUpdateRequest { device_token }),
            platform_details: self.ctx.config.platform_details.clone(),
            initial_content_encrypted_message: content_session.message,
            initial_notifications_encrypted_message: notifications_message,
        };
        let input = serde_json::to_value(&request).map_err(anyhow::Error::from)?;

        info!(
            keyserver_id = %keyserver_id,
            source = inputs.auth_action_source.as_str(),
            "authenticating with keyserver"
        );
        let requests = KeyserverRequests::from([(keyserver_id.clone(), input)]);
        if let Err(err) = caller
            .call_many(Endpoint::KeyserverAuth, requests, CallOptions::default())
            .await
        {
            if err.has_message(CLIENT_VERSION_UNSUPPORTED) {
                self.ctx.store.dispatch(Action::SetConnectionIssue {
                    keyserver_id: keyserver_id.clone(),
                    issue: Some(ConnectionIssue::ClientVersionUnsupported),
                });
            }
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
