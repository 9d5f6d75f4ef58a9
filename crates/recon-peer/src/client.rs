use async_trait::async_trait;
use recon_core::{Frame, ImageRelay, NodeClient, PeerError, RelayError};
use recon_model::{NodeId, TaskDescriptor, TaskId};
use reqwest::{
    Client, StatusCode, Url,
    multipart::{Form, Part},
};
use tracing::{debug, instrument};

use crate::{config::PeerConfig, errors::HttpPeerError};

/// reqwest-backed transport to other nodes.
#[derive(Debug, Clone)]
pub struct HttpPeer {
    client: Client,
}

impl HttpPeer {
    pub fn new(cfg: &PeerConfig) -> Result<Self, HttpPeerError> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .connect_timeout(cfg.connect_timeout)
            .user_agent(cfg.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    /// `GET` an endpoint on `address`, treating any non-2xx as a rejection.
    pub(crate) async fn get(
        &self,
        address: &str,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<(), PeerError> {
        let url = endpoint(address, segments, query).map_err(|e| PeerError::Unreachable {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        debug!(%url, "peer request");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PeerError::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        check(address, response.status())
    }
}

#[async_trait]
impl NodeClient for HttpPeer {
    #[instrument(level = "debug", skip_all, fields(%address, task = %descriptor.id))]
    async fn init_task(
        &self,
        address: &str,
        node: &NodeId,
        descriptor: &TaskDescriptor,
    ) -> Result<(), PeerError> {
        self.get(
            address,
            &[
                "task",
                "init",
                descriptor.kind.as_str(),
                descriptor.id.as_str(),
                descriptor.name.as_str(),
                descriptor.priority.as_str(),
            ],
            &[("node", node.as_str())],
        )
        .await
    }

    #[instrument(level = "debug", skip_all, fields(%address, %task))]
    async fn stop_task(&self, address: &str, task: &TaskId) -> Result<(), PeerError> {
        self.get(address, &["task", "stop", task.as_str()], &[]).await
    }
}

#[async_trait]
impl ImageRelay for HttpPeer {
    async fn send(&self, destination: &str, frame: Frame) -> Result<u16, RelayError> {
        let sequence = frame.sequence.to_string();
        let url = endpoint(
            destination,
            &["image", frame.task_id.as_str()],
            &[("node", frame.node_id.as_str()), ("seq", &sequence)],
        )
        .map_err(|e| RelayError::Destination(e.to_string()))?;

        let bytes = frame.payload.len();
        let part = Part::bytes(frame.payload)
            .file_name(format!("{}_{}.jpg", frame.node_id, frame.sequence))
            .mime_str("image/jpeg")
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(%destination, task = %frame.task_id, sequence = frame.sequence, bytes, status = status.as_u16(), "image uploaded");
        if !status.is_success() {
            return Err(RelayError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(status.as_u16())
    }
}

/// Join `segments` onto `base` (each percent-encoded) and append `query`.
pub(crate) fn endpoint(
    base: &str,
    segments: &[&str],
    query: &[(&str, &str)],
) -> Result<Url, HttpPeerError> {
    let mut url = Url::parse(base).map_err(|_| HttpPeerError::InvalidAddress(base.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| HttpPeerError::InvalidAddress(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

fn check(address: &str, status: StatusCode) -> Result<(), PeerError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(PeerError::Rejected {
            address: address.to_string(),
            status: status.as_u16(),
        })
    }
}
