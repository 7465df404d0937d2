//! HTTP forwarding sink: one JSON `POST` per record.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::Sink;
use crate::error::DeliveryError;
use crate::models::EventRecord;

// ---

pub struct HttpSink {
    // ---
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    // ---
    /// Build a sink posting to `{base_url}/api/{resource_path}`.
    pub fn new(
        base_url: &str,
        resource_path: &str,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        // ---
        let client = reqwest::Client::builder()
            .user_agent(concat!("telemetry-bridge/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;

        let endpoint = format!(
            "{}/api/{}",
            base_url.trim_end_matches('/'),
            resource_path.trim_matches('/')
        );

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Sink for HttpSink {
    // ---
    async fn deliver(&self, record: &EventRecord) -> Result<(), DeliveryError> {
        // ---
        let response = self
            .client
            .post(&self.endpoint)
            .json(record)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    DeliveryError::rejected(None, e.to_string())
                } else {
                    DeliveryError::transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // 429 and 5xx may clear up on their own; any other status is final.
        let message = format!("{} responded {}", self.endpoint, status);
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(DeliveryError::transport(message).with_status(status.as_u16()))
        } else {
            Err(DeliveryError::rejected(Some(status.as_u16()), message))
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
