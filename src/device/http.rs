//! HTTP transport for dispensers.
//!
//! Each request is bounded twice: by reqwest's own timeout and by an outer
//! `tokio::time::timeout`, so a device that accepts the TCP connection and then
//! stalls still resolves within the configured window.

use async_trait::async_trait;
use log::{debug, trace};
use std::time::Duration;
use tokio::time::timeout;

use super::{DeviceTransport, DispenseRequest, IdentityReport, TransportError};
use crate::logutil::body_preview;

const USER_AGENT: &str = "SyrupDispenser/1.0";

pub struct HttpTransport {
    client: reqwest::Client,
    port: u16,
    probe_timeout: Duration,
    dispense_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport that targets `port` on every host that is given without one.
    pub fn new(
        port: u16,
        probe_timeout: Duration,
        dispense_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::Other(format!("client setup failed: {}", e)))?;
        Ok(Self {
            client,
            port,
            probe_timeout,
            dispense_timeout,
        })
    }

    /// `host` gets the configured port; `host:port` is used verbatim.
    pub fn base_url(&self, network_address: &str) -> String {
        if network_address.contains(':') {
            format!("http://{}", network_address)
        } else {
            format!("http://{}:{}", network_address, self.port)
        }
    }
}

#[async_trait]
impl DeviceTransport for HttpTransport {
    async fn probe(&self, network_address: &str) -> Result<IdentityReport, TransportError> {
        let url = format!("{}/", self.base_url(network_address));
        let request = self.client.get(&url).timeout(self.probe_timeout).send();
        let response = timeout(self.probe_timeout, request)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            trace!("probe {} -> HTTP {}", url, status);
            return Err(TransportError::Status(status.as_u16()));
        }
        let body = response.bytes().await.map_err(classify)?;
        serde_json::from_slice::<IdentityReport>(&body).map_err(|e| {
            trace!("probe {} -> unparseable body '{}'", url, body_preview(&body));
            TransportError::Malformed(e.to_string())
        })
    }

    async fn dispense(
        &self,
        network_address: &str,
        total_quantity: u32,
    ) -> Result<(), TransportError> {
        let url = format!("{}/dispense", self.base_url(network_address));
        let payload = DispenseRequest::for_quantity(total_quantity);
        debug!("POST {} amount='{}'", url, payload.amount);
        let request = self
            .client
            .post(&url)
            .timeout(self.dispense_timeout)
            .json(&payload)
            .send();
        let response = timeout(self.dispense_timeout, request)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(classify)?;

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            Ok(())
        } else {
            let body = response.bytes().await.unwrap_or_default();
            debug!(
                "dispense {} rejected: HTTP {} '{}'",
                url,
                status,
                body_preview(&body)
            );
            Err(TransportError::Status(status.as_u16()))
        }
    }
}

/// Map a reqwest failure onto the transport taxonomy.
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    if let Some(kind) = io_error_kind(&err) {
        match kind {
            std::io::ErrorKind::ConnectionRefused => return TransportError::Refused,
            std::io::ErrorKind::TimedOut => return TransportError::Timeout,
            _ => {}
        }
    }
    if err.is_connect() {
        return TransportError::Unreachable;
    }
    if err.is_decode() || err.is_body() {
        return TransportError::Malformed(err.to_string());
    }
    TransportError::Other(err.to_string())
}

fn io_error_kind(err: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = inner.source();
    }
    None
}
