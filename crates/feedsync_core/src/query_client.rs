/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use feedsync_protocol::{PageRequest, ResponseBag};
use tracing::debug;

use crate::config::SyncConfig;
use crate::feed::RemoteQuery;
use crate::http_retry::send_with_retry;

/// `RemoteQuery` over HTTP: `POST {base}/feed/{kind}` with the request as
/// JSON, answered by a `ResponseBag`. Retries live here, not in the
/// controller.
#[derive(Clone)]
pub struct HttpQueryClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    attempts: u32,
}

impl HttpQueryClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: Option<String>, attempts: u32) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
            attempts,
        }
    }

    pub fn from_config(cfg: &SyncConfig) -> Result<Self> {
        let base = cfg
            .query_base_url
            .as_deref()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .context("query_base_url not configured")?;
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .context("build http client")?;
        Ok(Self::new(http, base, cfg.query_token.clone(), cfg.http_attempts()))
    }

    pub fn endpoint(&self, request: &PageRequest) -> String {
        format!("{}/feed/{}", self.base_url, request.feed_kind)
    }
}

#[async_trait]
impl RemoteQuery for HttpQueryClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<ResponseBag> {
        let url = self.endpoint(request);
        debug!("fetch page {url} until={:?} limit={}", request.until, request.limit);
        let resp = send_with_retry(
            || {
                let mut req = self.http.post(&url).json(request);
                if let Some(tok) = self.token.as_ref() {
                    req = req.header("Authorization", format!("Bearer {tok}"));
                }
                req
            },
            self.attempts,
        )
        .await
        .with_context(|| format!("query {url}"))?
        .error_for_status()
        .with_context(|| format!("query {url}"))?;
        let bag = resp
            .json::<ResponseBag>()
            .await
            .with_context(|| format!("decode response from {url}"))?;
        Ok(bag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_feed_kind_and_trims_base() {
        let client = HttpQueryClient::new(reqwest::Client::new(), "https://q.example/api/", Some("  ".into()), 3);
        let req = PageRequest {
            feed_kind: "articles".to_string(),
            owner_id: "alice".to_string(),
            spec: "latest".to_string(),
            limit: 20,
            until: None,
            viewer_id: None,
        };
        assert_eq!(client.endpoint(&req), "https://q.example/api/feed/articles");
        assert!(client.token.is_none());
    }

    #[test]
    fn from_config_requires_base_url() {
        assert!(HttpQueryClient::from_config(&SyncConfig::default()).is_err());
    }
}
