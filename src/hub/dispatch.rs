//! HTTP calls from the hub to registered agents.

use reqwest::Url;
use std::time::Duration;

use crate::error::Error;

/// Build `<address>/execute/<command>?from=<sender>&args=<a1>&args=<a2>...`.
pub fn execute_url(
    address: &str,
    command: &str,
    sender: &str,
    args: &[String],
) -> Result<Url, Error> {
    let mut url = Url::parse(address)
        .map_err(|e| Error::Other(format!("invalid agent address {}: {}", address, e)))?;

    url.path_segments_mut()
        .map_err(|_| Error::Other(format!("agent address {} cannot take a path", address)))?
        .pop_if_empty()
        .push("execute")
        .push(command);

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("from", sender);
        for arg in args {
            query.append_pair("args", arg);
        }
    }

    Ok(url)
}

/// Client for agents' `/execute` endpoint.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { http })
    }

    /// Run `command` on the agent at `address`; returns the response body
    /// whatever the status, since agents put errors in the body too.
    pub async fn execute(
        &self,
        address: &str,
        command: &str,
        sender: &str,
        args: &[String],
    ) -> Result<String, Error> {
        let url = execute_url(address, command, sender, args)?;
        tracing::info!("Dispatching GET {}", url);

        // reqwest errors name the URL themselves.
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        let body = response.text().await?;

        tracing::debug!("{} answered {} with {} bytes", url, status, body.len());
        Ok(body)
    }
}
