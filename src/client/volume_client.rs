//! Blocking HTTP client for a running vreserve service.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::time::Duration;

use ureq::{Agent, AgentBuilder};

use crate::core::errors::{Result, VrError};
use crate::daemon::protocol::{
    ROUTE_PING, ROUTE_RELEASE, ROUTE_REPORT, ROUTE_RESERVE, VolumeResponse,
};

/// Default request timeout for [`VolumeClient::new`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client bound to one service base URL, e.g. `http://127.0.0.1:8188`.
#[derive(Clone)]
pub struct VolumeClient {
    service_url: String,
    agent: Agent,
}

impl std::fmt::Debug for VolumeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeClient")
            .field("service_url", &self.service_url)
            .finish_non_exhaustive()
    }
}

impl VolumeClient {
    #[must_use]
    pub fn new(service_url: impl Into<String>) -> Self {
        Self::with_timeout(service_url, DEFAULT_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(service_url: impl Into<String>, timeout: Duration) -> Self {
        let service_url = service_url.into().trim_end_matches('/').to_string();
        Self {
            service_url,
            agent: AgentBuilder::new().timeout(timeout).build(),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.service_url
    }

    /// Succeeds when the service answers at all within `timeout`.
    pub fn ping(&self, timeout: Duration) -> Result<()> {
        let agent = AgentBuilder::new().timeout(timeout).build();
        match agent.get(&self.url(ROUTE_PING)).call() {
            Ok(_) | Err(ureq::Error::Status(..)) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Ask the service to reserve `bytes` for `path`. Returns `Ok(true)` on admission.
    pub fn reserve(&self, path: &str, bytes: u64) -> Result<bool> {
        require_path(path)?;
        if bytes == 0 {
            return Err(VrError::invalid_argument(
                "you must request at least one byte of storage",
            ));
        }
        let bytes = bytes.to_string();
        let response = decode(
            self.agent
                .post(&self.url(ROUTE_RESERVE))
                .send_form(&[("path", path), ("bytes", &bytes)]),
        )?;
        Ok(response.succeeded)
    }

    /// Release whatever is reserved for `path`.
    pub fn release(&self, path: &str) -> Result<()> {
        require_path(path)?;
        decode(
            self.agent
                .post(&self.url(ROUTE_RELEASE))
                .send_form(&[("path", path)]),
        )?;
        Ok(())
    }

    /// Reservations on the volume holding `path`.
    pub fn report(&self, path: &str) -> Result<BTreeMap<String, u64>> {
        require_path(path)?;
        let response = decode(
            self.agent
                .get(&self.url(ROUTE_REPORT))
                .query("path", path)
                .call(),
        )?;
        Ok(response.data.unwrap_or_default())
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.service_url)
    }
}

fn require_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(VrError::invalid_argument("path cannot be empty"));
    }
    Ok(())
}

/// Decode the JSON body of any response, including error statuses.
fn decode(result: std::result::Result<ureq::Response, ureq::Error>) -> Result<VolumeResponse> {
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(error) => return Err(error.into()),
    };
    let status = response.status();
    let body: VolumeResponse = response.into_json().map_err(|error| VrError::Transport {
        details: format!("undecodable response (HTTP {status}): {error}"),
    })?;
    if !body.error_message.is_empty() {
        return Err(VrError::Rejected {
            status,
            message: body.error_message,
        });
    }
    if !(200..300).contains(&status) {
        return Err(VrError::Rejected {
            status,
            message: format!("HTTP {status}"),
        });
    }
    Ok(body)
}
