use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{stream::FuturesUnordered, StreamExt};
use serde_json::Value;
use shared::domain::KeyserverId;

use crate::{
    endpoints::Endpoint,
    error::CallError,
    executor::{CallOptions, SharedCaller},
};

pub type KeyserverRequests = BTreeMap<KeyserverId, Value>;
pub type KeyserverResponses = BTreeMap<KeyserverId, Value>;

#[async_trait]
pub trait CallKeyserverEndpoint: Send + Sync {
    fn caller(&self, keyserver_id: &KeyserverId) -> Result<SharedCaller, CallError>;

    /// Calls every keyserver in `requests` concurrently and waits for all of
    /// them. Fails with the first failure to complete, but only once every
    /// call has settled.
    async fn call_many(
        &self,
        endpoint: Endpoint,
        requests: KeyserverRequests,
        options: CallOptions,
    ) -> Result<KeyserverResponses, CallError> {
        let mut responses = KeyserverResponses::new();
        for (keyserver_id, result) in settle_all(self, endpoint, requests, options).await {
            responses.insert(keyserver_id, result?);
        }
        Ok(responses)
    }

    async fn call_many_settled(
        &self,
        endpoint: Endpoint,
        requests: KeyserverRequests,
        options: CallOptions,
    ) -> BTreeMap<KeyserverId, Result<Value, CallError>> {
        settle_all(self, endpoint, requests, options)
            .await
            .into_iter()
            .collect()
    }
}

async fn settle_all<S>(
    source: &S,
    endpoint: Endpoint,
    requests: KeyserverRequests,
    options: CallOptions,
) -> Vec<(KeyserverId, Result<Value, CallError>)>
where
    S: CallKeyserverEndpoint + ?Sized,
{
    let mut pending: FuturesUnordered<_> = requests
        .into_iter()
        .map(|(keyserver_id, input)| {
            let options = options.clone();
            async move {
                let result = match source.caller(&keyserver_id) {
                    Ok(caller) => caller.call(endpoint, input, options).await,
                    Err(err) => Err(err),
                };
                (keyserver_id, result)
            }
        })
        .collect();

    let mut settled = Vec::new();
    while let Some(entry) = pending.next().await {
        settled.push(entry);
    }
    settled
}

pub struct SingleKeyserverFanOut {
    keyserver_id: KeyserverId,
    caller: SharedCaller,
}

impl SingleKeyserverFanOut {
    pub fn new(keyserver_id: KeyserverId, caller: SharedCaller) -> Self {
        Self {
            keyserver_id,
            caller,
        }
    }
}

#[async_trait]
impl CallKeyserverEndpoint for SingleKeyserverFanOut {
    fn caller(&self, keyserver_id: &KeyserverId) -> Result<SharedCaller, CallError> {
        if *keyserver_id == self.keyserver_id {
            Ok(self.caller.clone())
        } else {
            Err(CallError::UnknownKeyserver(keyserver_id.clone()))
        }
    }

    /// Requests addressed to other keyservers are dropped.
    async fn call_many(
        &self,
        endpoint: Endpoint,
        mut requests: KeyserverRequests,
        options: CallOptions,
    ) -> Result<KeyserverResponses, CallError> {
        requests.retain(|keyserver_id, _| *keyserver_id == self.keyserver_id);
        let mut responses = KeyserverResponses::new();
        for (keyserver_id, result) in settle_all(self, endpoint, requests, options).await {
            responses.insert(keyserver_id, result?);
        }
        Ok(responses)
    }
}

#[cfg(test)]
#[path = "tests/fanout_tests.rs"]
mod tests;
