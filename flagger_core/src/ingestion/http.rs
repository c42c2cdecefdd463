//! The outbound HTTP capability of the ingestion pipeline.

use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};

use crate::Result;

/// Bodies larger than this are gzip-compressed before sending.
const GZIP_THRESHOLD_BYTES: usize = 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The pipeline's only view of the network: POST a serialized batch to the
/// ingestion URL. Success is an HTTP 2xx; anything else is an error that
/// feeds the retry queue.
///
/// Tests inject a recording implementation.
pub trait HttpSender: Send + Sync {
    fn post<'a>(&'a self, body: &'a [u8], url: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Production [`HttpSender`] backed by a shared [`reqwest::Client`].
pub struct ReqwestSender {
    // Client holds a connection pool internally, so we're reusing the client
    // between requests.
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new() -> Result<ReqwestSender> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(ReqwestSender { client })
    }
}

impl HttpSender for ReqwestSender {
    fn post<'a>(&'a self, body: &'a [u8], url: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let request = self.client.post(url).header(CONTENT_TYPE, "application/json");

            let request = if body.len() > GZIP_THRESHOLD_BYTES {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                let compressed = encoder.finish()?;
                request.header(CONTENT_ENCODING, "gzip").body(compressed)
            } else {
                request.body(body.to_vec())
            };

            let response = request.send().await?;
            response.error_for_status()?;

            log::debug!(target: "flagger", "ingested {} bytes to {url}", body.len());
            Ok(())
        })
    }
}
