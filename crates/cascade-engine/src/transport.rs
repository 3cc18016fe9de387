use std::time::Duration;

use futures::future::BoxFuture;

use cascade_core::error::{CascadeError, Result};
use cascade_core::traits::DestinationTransport;

/// `reqwest`-backed transport for webhook and external API destinations.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CascadeError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl DestinationTransport for HttpTransport {
    fn post_json(&self, url: &str, payload: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        let url = url.to_string();
        Box::pin(async move {
            let resp = self
                .client
                .post(&url)
                .json(&payload)
                .send()
                .await
                .map_err(|e| CascadeError::Http(format!("POST {} failed: {}", url, e)))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(CascadeError::Http(format!(
                    "POST {} returned {}: {}",
                    url, status, body
                )));
            }
            Ok(())
        })
    }
}
