//! Thin JSON-over-HTTP client shared by the service-backed task managers.

use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::TaskError;
use crate::metrics;

pub struct HttpService {
    name: &'static str,
    client: Client,
    base_url: String,
}

impl HttpService {
    pub fn new(name: &'static str, base_url: &str, timeout: Duration) -> Result<Self, TaskError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            TaskError::Unexpected(format!("Failed to build {} HTTP client: {}", name, e))
        })?;

        Ok(Self {
            name,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join a path to the base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send a request and require a 2xx response.
    ///
    /// Connection failures and error statuses are recoverable; the status is
    /// kept so callers can treat 404 specially.
    pub async fn send(
        &self,
        request: RequestBuilder,
        error_message: &str,
    ) -> Result<Response, TaskError> {
        let start = Instant::now();
        let result = request.send().await;
        metrics::EXTERNAL_SERVICE_DURATION
            .with_label_values(&[self.name])
            .observe(start.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::EXTERNAL_SERVICE_REQUESTS
                    .with_label_values(&[self.name, "error"])
                    .inc();
                return Err(TaskError::recoverable(format!("{}: {}", error_message, e)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            metrics::EXTERNAL_SERVICE_REQUESTS
                .with_label_values(&[self.name, "error"])
                .inc();
            return Err(TaskError::Recoverable {
                message: format!(
                    "{}: HTTP {} ({})",
                    error_message,
                    status.as_u16(),
                    response.url()
                ),
                status: Some(status.as_u16()),
            });
        }

        metrics::EXTERNAL_SERVICE_REQUESTS
            .with_label_values(&[self.name, "success"])
            .inc();
        debug!(service = self.name, url = %response.url(), "Request succeeded");
        Ok(response)
    }

    /// Send a request and decode the JSON body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        error_message: &str,
    ) -> Result<T, TaskError> {
        let response = self.send(request, error_message).await?;
        response.json().await.map_err(|e| {
            TaskError::Unexpected(format!("{}: invalid JSON response: {}", error_message, e))
        })
    }

    /// Send a request whose outcome doesn't matter; failures are only logged.
    pub async fn send_consume(&self, request: RequestBuilder, error_message: &str) {
        if let Err(e) = self.send(request, error_message).await {
            warn!(service = self.name, "{}", e);
        }
    }
}
