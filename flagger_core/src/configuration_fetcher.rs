//! An HTTP client that fetches the initial configuration from the server.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;

use crate::{Configuration, Error, Result};

/// Number of attempts against each source before giving up on it.
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 2;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationFetcherConfig {
    /// Primary source URL, already carrying the API key.
    pub source_url: String,
    /// Backup source, tried with a fresh retry budget once the primary is
    /// exhausted.
    pub backup_source_url: String,
    pub attempts: u32,
}

/// A client that fetches Flagger configuration from the server.
pub struct ConfigurationFetcher {
    // Client holds a connection pool internally, so we're reusing the client
    // between requests.
    client: reqwest::Client,
    config: ConfigurationFetcherConfig,
}

impl ConfigurationFetcher {
    pub fn new(config: ConfigurationFetcherConfig) -> Result<ConfigurationFetcher> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(ConfigurationFetcher { client, config })
    }

    /// Fetch the configuration, falling back to the backup source when the
    /// primary retry budget is exhausted.
    pub async fn fetch(&self) -> Result<Configuration> {
        match self.fetch_from(&self.config.source_url).await {
            Ok(configuration) => Ok(configuration),
            Err(err) => {
                log::warn!(target: "flagger",
                    "unable to fetch configuration from the source URL: {err}");

                self.fetch_from(&self.config.backup_source_url)
                    .await
                    .map_err(|err| {
                        log::warn!(target: "flagger",
                            "unable to fetch configuration from the backup source URL: {err}");
                        Error::ConfigurationFetchFailed
                    })
            }
        }
    }

    async fn fetch_from(&self, url: &str) -> Result<Configuration> {
        let mut last_error = Error::ConfigurationFetchFailed;

        for attempt in 1..=self.config.attempts.max(1) {
            match self.fetch_once(url).await {
                Ok(configuration) => {
                    log::debug!(target: "flagger",
                        "successfully fetched configuration on attempt {attempt}");
                    return Ok(configuration);
                }
                Err(err) => {
                    log::debug!(target: "flagger",
                        "configuration fetch attempt {attempt} failed: {err}");
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    async fn fetch_once(&self, url: &str) -> Result<Configuration> {
        let response = self
            .client
            .get(url)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;

        // Any non-200 response counts as a transport failure and is retried.
        let response = response.error_for_status()?;

        let body = response.bytes().await?;
        let configuration = serde_json::from_slice(&body)?;

        Ok(configuration)
    }
}
