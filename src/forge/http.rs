//! Production [`Transport`] backed by `reqwest`.

use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use tracing::trace;

use super::{HttpResponse, Transport};
use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, headers: &HeaderMap) -> Result<HttpResponse, SyncError> {
        let resp = self
            .client
            .get(url)
            .headers(headers.clone())
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| SyncError::Network(format!("failed to read response body: {e}")))?;

        trace!(url, status, bytes = body.len(), "upstream response");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
