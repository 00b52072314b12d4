//! Agent node: keeps itself registered with the hub and runs commands for it.

pub mod server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::time::MissedTickBehavior;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::executor::Executor;

pub use server::create_router;

/// Connect timeout for calls to the hub.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Agent {
    name: String,
    upstream: Url,
    listen: SocketAddr,
    executor: Executor,
    http: reqwest::Client,
    register_interval: Duration,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        upstream: &str,
        listen: SocketAddr,
        executor: Executor,
        register_interval: Duration,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Config("Agent name must not be empty".to_string()));
        }
        let upstream = Url::parse(upstream)
            .map_err(|e| Error::Config(format!("Invalid upstream URL {}: {}", upstream, e)))?;
        if upstream.cannot_be_a_base() {
            return Err(Error::Config(format!("Invalid upstream URL {}", upstream)));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            name,
            upstream,
            listen,
            executor,
            http,
            register_interval,
        })
    }

    /// Build an agent from settings, with CLI values taking precedence.
    pub fn from_settings(
        settings: &Settings,
        name: Option<String>,
        upstream: Option<String>,
        listen: Option<SocketAddr>,
        executor: Executor,
    ) -> Result<Self> {
        let name = name
            .or_else(|| settings.agent.name.clone())
            .ok_or_else(|| Error::Config("Agent name is required (--name or agent.name)".to_string()))?;
        let upstream = upstream.unwrap_or_else(|| settings.agent.upstream.clone());
        let listen = match listen {
            Some(listen) => listen,
            None => settings.agent.listen.parse().map_err(|e| {
                Error::Config(format!("Invalid agent listen address {}: {}", settings.agent.listen, e))
            })?,
        };

        Self::new(name, &upstream, listen, executor, settings.agent.register_interval())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// `<upstream>/register/<name>?port=<port>`.
    pub fn registration_url(&self, port: u16) -> Result<Url> {
        let mut url = self.upstream_path(&["register", &self.name])?;
        url.query_pairs_mut().append_pair("port", &port.to_string());
        Ok(url)
    }

    /// `<upstream>/message/<path>`, one URL segment per `/`-separated part.
    pub fn message_url(&self, path: &str) -> Result<Url> {
        let mut segments = vec!["message"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.upstream_path(&segments)
    }

    fn upstream_path(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.upstream.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("Invalid upstream URL {}", self.upstream)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Register once; returns the hub's answer.
    pub async fn register_once(&self, port: u16) -> Result<String> {
        let url = self.registration_url(port)?;
        let response = self.http.put(url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            Ok(body.trim().to_string())
        } else {
            Err(Error::Other(format!("hub answered {}: {}", status, body.trim())))
        }
    }

    /// Register now and then every interval, forever. Failures are logged.
    pub async fn registration_loop(&self, port: u16) {
        let mut ticker = tokio::time::interval(self.register_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.register_once(port).await {
                Ok(answer) => tracing::debug!("Registration: {}", answer),
                Err(e) => tracing::warn!("Registration with {} failed: {}", self.upstream, e),
            }
        }
    }

    /// Serve commands and keep registering until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen).await?;
        let port = listener.local_addr()?.port();
        tracing::info!(
            "Agent {} listening on {} ({} scripts), upstream {}",
            self.name,
            self.listen,
            self.executor.catalog().len(),
            self.upstream
        );

        let app = create_router(Arc::clone(&self));
        tokio::select! {
            _ = self.registration_loop(port) => Ok(()),
            result = axum::serve(listener, app) => {
                result?;
                Ok(())
            }
        }
    }
}
