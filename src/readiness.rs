use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use reqwest::blocking::Client as BlockingClient;
use tracing::{debug, info};

use crate::config::ReadinessSettings;

/// Result of one polling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessOutcome {
    pub ready: bool,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Polls `GET /` on a local port until any HTTP response arrives.
pub struct ReadinessPoller {
    client: BlockingClient,
    host: String,
    interval: Duration,
}

impl ReadinessPoller {
    pub fn new(request_timeout: Duration, interval: Duration) -> Result<Self> {
        let client = BlockingClient::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .context("failed to build readiness HTTP client")?;
        Ok(Self {
            client,
            host: "localhost".to_string(),
            interval,
        })
    }

    pub fn from_settings(settings: &ReadinessSettings) -> Result<Self> {
        Self::new(settings.request_timeout(), settings.interval())
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Returns true as soon as the endpoint answers; false after
    /// `max_attempts` failed requests.
    pub fn wait_until_ready(&self, port: u16, max_attempts: u32) -> bool {
        self.poll(port, max_attempts).ready
    }

    pub fn poll(&self, port: u16, max_attempts: u32) -> ReadinessOutcome {
        let url = format!("http://{}:{port}/", self.host);
        let started = Instant::now();
        info!(%url, max_attempts, "waiting for server");

        for attempt in 1..=max_attempts {
            match self.client.get(&url).send() {
                Ok(response) => {
                    info!(
                        %url,
                        attempt,
                        status = response.status().as_u16(),
                        "server is ready"
                    );
                    return ReadinessOutcome {
                        ready: true,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                Err(err) => {
                    debug!(%url, attempt, error = %err, "server not answering yet");
                    if attempt % 5 == 0 {
                        info!(attempt, max_attempts, "still waiting for server");
                    }
                }
            }
            thread::sleep(self.interval);
        }

        ReadinessOutcome {
            ready: false,
            attempts: max_attempts,
            elapsed: started.elapsed(),
        }
    }
}
