//! HTTP client for the Hetzner Cloud API

use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::Instant;

use rc_core::config::CloudConfig;

use super::error::{CloudError, UNKNOWN_CODE};
use super::types::{
    CreateServerBody, CreateSshKeyBody, ErrorEnvelope, Server, ServerEnvelope, ServerSpec, SshKey,
    SshKeyEnvelope, SshKeyList,
};
use super::{CloudApi, ProgressFn};

/// Longest slice of an unstructured error body kept in the message
const MAX_ERROR_BODY: usize = 200;

/// Hetzner Cloud API client
#[derive(Debug, Clone)]
pub struct HcloudClient {
    client: Client,
    base_url: String,
    poll_interval: Duration,
}

impl HcloudClient {
    /// Create a client from the `[cloud]` configuration
    pub fn new(config: &CloudConfig) -> Result<Self, CloudError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            poll_interval: config.poll_interval,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a request and map non-success responses to [`CloudError::Api`]
    async fn send<B: serde::Serialize + ?Sized>(
        &self,
        token: &str,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, CloudError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("{} {}", method, url);

        let mut request = self.client.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| CloudError::Network {
            message: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let error = match serde_json::from_str::<ErrorEnvelope>(&text) {
            Ok(envelope) => CloudError::Api {
                status: status.as_u16(),
                code: envelope.error.code,
                message: envelope.error.message,
            },
            Err(_) => CloudError::Api {
                status: status.as_u16(),
                code: UNKNOWN_CODE.to_string(),
                message: unstructured_message(status, &text),
            },
        };
        tracing::debug!("{} failed: {}", path, error);
        Err(error)
    }

    async fn get_json<T: DeserializeOwned>(&self, token: &str, path: &str) -> Result<T, CloudError> {
        let response = self.send::<()>(token, Method::GET, path, None).await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, CloudError> {
    response
        .json::<T>()
        .await
        .map_err(|e| CloudError::Decode(e.to_string()))
}

fn unstructured_message(status: reqwest::StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
    }
    body.chars().take(MAX_ERROR_BODY).collect()
}

#[async_trait]
impl CloudApi for HcloudClient {
    async fn validate_credential(&self, token: &str) -> bool {
        match self
            .send::<()>(token, Method::GET, "/servers?per_page=1", None)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Credential check failed: {}", e);
                false
            }
        }
    }

    async fn create_ssh_key(
        &self,
        token: &str,
        name: &str,
        public_key: &str,
    ) -> Result<SshKey, CloudError> {
        let body = CreateSshKeyBody { name, public_key };
        let created = match self.send(token, Method::POST, "/ssh_keys", Some(&body)).await {
            Ok(response) => response,
            Err(e) if e.is_uniqueness_conflict() => {
                tracing::info!("SSH key {} already exists, looking it up", name);
                let list: SshKeyList = self.get_json(token, "/ssh_keys").await?;
                return match list.ssh_keys.into_iter().find(|k| k.name == name) {
                    Some(existing) => Ok(existing),
                    None => Err(e),
                };
            }
            Err(e) => return Err(e),
        };

        let envelope: SshKeyEnvelope = decode(created).await?;
        Ok(envelope.ssh_key)
    }

    async fn create_server(&self, token: &str, spec: &ServerSpec) -> Result<Server, CloudError> {
        let body = CreateServerBody {
            spec,
            start_after_create: true,
        };
        let response = self
            .send(token, Method::POST, "/servers", Some(&body))
            .await?;
        let envelope: ServerEnvelope = decode(response).await?;
        Ok(envelope.server)
    }

    async fn get_server(&self, token: &str, id: u64) -> Result<Server, CloudError> {
        let envelope: ServerEnvelope = self.get_json(token, &format!("/servers/{}", id)).await?;
        Ok(envelope.server)
    }

    async fn wait_for_server_running(
        &self,
        token: &str,
        id: u64,
        on_progress: ProgressFn<'_>,
        timeout: Duration,
    ) -> Result<(), CloudError> {
        let deadline = Instant::now() + timeout;

        loop {
            let server = self.get_server(token, id).await?;
            on_progress(&format!("Server status: {}", server.status));

            if server.is_running() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CloudError::Timeout {
                    server_id: id,
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete_server(&self, token: &str, id: u64) -> Result<(), CloudError> {
        self.send::<()>(token, Method::DELETE, &format!("/servers/{}", id), None)
            .await?;
        tracing::info!("Deleted server {}", id);
        Ok(())
    }

    async fn delete_ssh_key(&self, token: &str, id: u64) -> Result<(), CloudError> {
        self.send::<()>(token, Method::DELETE, &format!("/ssh_keys/{}", id), None)
            .await?;
        tracing::info!("Deleted SSH key {}", id);
        Ok(())
    }
}
