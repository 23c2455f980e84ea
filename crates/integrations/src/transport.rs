use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use insureflow_core::errors::IntegrationError;

const API_KEY_HEADER: &str = "X-API-KEY";

/// JSON-over-HTTP access to one provider base URL.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    timeout_secs: u64,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(timeout_secs)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            timeout_secs,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get_json(&self, operation: &str, path: &str) -> Result<Value, IntegrationError> {
        let response = self.send(operation, self.client.get(self.url(path))).await?;
        read_json(operation, response).await
    }

    /// Like [`get_json`](Self::get_json) but maps 404 to `None`.
    pub async fn find_json(&self, operation: &str, path: &str) -> Result<Option<Value>, IntegrationError> {
        let response = self.send(operation, self.client.get(self.url(path))).await;
        match response {
            Err(IntegrationError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error),
            Ok(response) => read_json(operation, response).await.map(Some),
        }
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
    ) -> Result<Value, IntegrationError> {
        let response = self.send(operation, self.client.post(self.url(path)).json(body)).await?;
        read_json(operation, response).await
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, IntegrationError> {
        let request = match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key.expose_secret()),
            None => request,
        };

        let response = request.send().await.map_err(|error| self.transport_error(operation, error))?;
        let status = response.status();
        debug!(event_name = "integration.http.response", operation, status = status.as_u16());

        if status == StatusCode::NOT_FOUND {
            return Err(IntegrationError::not_found(operation, status.as_str()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event_name = "integration.http.failed",
                operation,
                status = status.as_u16(),
                "provider returned a non-success status"
            );
            return Err(IntegrationError::upstream(operation, format!("HTTP {status}: {}", snippet(&body))));
        }
        Ok(response)
    }

    fn transport_error(&self, operation: &str, error: reqwest::Error) -> IntegrationError {
        if error.is_timeout() {
            IntegrationError::Timeout { operation: operation.to_owned(), timeout_secs: self.timeout_secs }
        } else {
            IntegrationError::upstream(operation, error.to_string())
        }
    }
}

async fn read_json(operation: &str, response: Response) -> Result<Value, IntegrationError> {
    response.json::<Value>().await.map_err(|error| IntegrationError::decode(operation, error.to_string()))
}

fn snippet(body: &str) -> &str {
    let end = body.char_indices().nth(200).map_or(body.len(), |(index, _)| index);
    &body[..end]
}
