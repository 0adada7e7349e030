//! HTTP client behind the CLI subcommands.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::api_objects::ErrorResponse;

/// Where a failed CLI call should land exit-code-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The server could not be reached or answered garbage.
    Transport,
    /// The server rejected the request.
    Validation,
}

#[derive(Debug)]
pub struct CliError {
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> std::result::Result<Resp, CliError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        Self::parse(response).await
    }

    pub async fn get<Resp: DeserializeOwned>(
        &self,
        path: &str,
    ) -> std::result::Result<Resp, CliError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.get(&url).send().await.map_err(transport)?;
        Self::parse(response).await
    }

    pub async fn delete(&self, path: &str) -> std::result::Result<(), CliError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.delete(&url).send().await.map_err(transport)?;
        Self::parse::<serde_json::Value>(response).await.map(|_| ())
    }

    async fn parse<Resp: DeserializeOwned>(
        response: reqwest::Response,
    ) -> std::result::Result<Resp, CliError> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(transport);
        }

        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.message,
            Err(_) => format!("request failed with {status}"),
        };
        let kind = if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
            FailureKind::Validation
        } else {
            FailureKind::Transport
        };
        Err(CliError { kind, message })
    }
}

fn transport(err: impl std::fmt::Display) -> CliError {
    CliError {
        kind: FailureKind::Transport,
        message: err.to_string(),
    }
}
