use core::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::environment::ReplicaHandle;
use crate::error::{ReplicaCall, RequestError, RequestErrorKind};
use crate::operation::{ChangeRequest, Operation};

#[derive(Serialize)]
struct SyncPeerRequest<'a> {
    peer: &'a str,
}

#[derive(Deserialize)]
struct StateHashResponse {
    hash: String,
}

/// JSON-over-HTTP client for the replica API.
///
/// Every call is bounded by a timeout and is attempted exactly once.
#[derive(Clone, Debug)]
pub struct ReplicaClient {
    http: Client,
    request_timeout: Duration,
}

impl ReplicaClient {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .connect_timeout(request_timeout)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http,
            request_timeout,
        })
    }

    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Liveness probe. A positive answer is a 2xx response carrying a JSON
    /// object whose `status`, when present, is `"ok"`.
    pub async fn health(
        &self,
        replica: &ReplicaHandle,
        attempt_timeout: Duration,
    ) -> Result<(), RequestError> {
        let call = ReplicaCall::Health;
        let builder = self
            .http
            .get(self.url(replica, call)?)
            .timeout(attempt_timeout);

        let body: Value = self.send(replica, call, builder).await?;

        let Some(object) = body.as_object() else {
            return Err(RequestError::new(
                replica.node_id(),
                call,
                RequestErrorKind::Malformed(format!("expected a JSON object, got {body}")),
            ));
        };

        match object.get("status").map(|status| status.as_str()) {
            None | Some(Some("ok")) => Ok(()),
            Some(status) => Err(RequestError::new(
                replica.node_id(),
                call,
                RequestErrorKind::Malformed(format!("unhealthy status {status:?}")),
            )),
        }
    }

    pub async fn submit_changes(
        &self,
        replica: &ReplicaHandle,
        changes: &[Operation],
    ) -> Result<Value, RequestError> {
        let call = ReplicaCall::Mutate;
        let builder = self
            .http
            .post(self.url(replica, call)?)
            .json(&ChangeRequest { changes });

        self.send(replica, call, builder).await
    }

    /// Asks `source` to synchronize with `target`.
    pub async fn sync_peer(
        &self,
        source: &ReplicaHandle,
        target: &ReplicaHandle,
    ) -> Result<Value, RequestError> {
        let call = ReplicaCall::SyncPeer;
        let peer = target.peer_address();
        let builder = self
            .http
            .post(self.url(source, call)?)
            .json(&SyncPeerRequest { peer: &peer });

        self.send(source, call, builder).await
    }

    pub async fn state_hash(&self, replica: &ReplicaHandle) -> Result<String, RequestError> {
        let call = ReplicaCall::StateHash;
        let builder = self.http.get(self.url(replica, call)?);

        let response: StateHashResponse = self.send(replica, call, builder).await?;

        Ok(response.hash)
    }

    pub async fn state(&self, replica: &ReplicaHandle) -> Result<Value, RequestError> {
        let call = ReplicaCall::State;
        let builder = self.http.get(self.url(replica, call)?);

        self.send(replica, call, builder).await
    }

    fn url(&self, replica: &ReplicaHandle, call: ReplicaCall) -> Result<Url, RequestError> {
        let mut url = replica.base_url().map_err(|err| {
            RequestError::new(
                replica.node_id(),
                call,
                RequestErrorKind::Transport(format!("invalid replica address: {err}")),
            )
        })?;
        url.set_path(call.path());

        Ok(url)
    }

    async fn send<O>(
        &self,
        replica: &ReplicaHandle,
        call: ReplicaCall,
        builder: RequestBuilder,
    ) -> Result<O, RequestError>
    where
        O: DeserializeOwned,
    {
        let node = replica.node_id();

        let response = builder
            .send()
            .await
            .map_err(|err| RequestError::from_reqwest(node, call, &err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|err| format!("<unreadable body: {err}>"));

            return Err(RequestError::new(
                node,
                call,
                RequestErrorKind::Status {
                    status: status.as_u16(),
                    body,
                },
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| RequestError::from_reqwest(node, call, &err))?;

        serde_json::from_slice(&bytes).map_err(|err| {
            RequestError::new(node, call, RequestErrorKind::Malformed(err.to_string()))
        })
    }
}
