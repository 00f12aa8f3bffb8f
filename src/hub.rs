//! Thin HTTPS client for the model hub.
//!
//! Two read-only calls — repository search and repository file listing —
//! plus the URL scheme downloads resolve against. The hub base URL is
//! injectable so tests can point it at a local fake.

use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_HUB_URL: &str = "https://huggingface.co";

/// One search hit as surfaced to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubModel {
    pub id: String,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub likes: u64,
    /// `.gguf` files available in the repository, when the listing
    /// includes siblings.
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiModel {
    id: String,
    #[serde(default)]
    downloads: u64,
    #[serde(default)]
    likes: u64,
    #[serde(default)]
    siblings: Vec<ApiSibling>,
}

#[derive(Debug, Deserialize)]
struct ApiSibling {
    rfilename: String,
}

pub struct HubClient {
    client: Client,
    base_url: String,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .user_agent("llama-fleet")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build hub client");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Entry URL a file download starts from.
    pub fn resolve_url(&self, repo: &str, filename: &str) -> String {
        format!("{}/{repo}/resolve/main/{filename}", self.base_url)
    }

    /// Search hub repositories, filtered to GGUF.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<HubModel>, Error> {
        let url = format!(
            "{}/api/models?search={}&filter=gguf&limit={limit}&full=true",
            self.base_url,
            urlencode(query),
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("hub search: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "hub search returned HTTP {}",
                response.status()
            )));
        }

        let models: Vec<ApiModel> = response
            .json()
            .await
            .context("parsing hub search response")?;
        Ok(models
            .into_iter()
            .map(|m| HubModel {
                id: m.id,
                downloads: m.downloads,
                likes: m.likes,
                files: m
                    .siblings
                    .into_iter()
                    .map(|s| s.rfilename)
                    .filter(|f| f.to_lowercase().ends_with(".gguf"))
                    .collect(),
            })
            .collect())
    }

    /// All file names in one hub repository.
    pub async fn list_repo_files(&self, repo: &str) -> Result<Vec<String>, Error> {
        let url = format!("{}/api/models/{repo}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("hub listing: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("hub repository {repo} not found")));
        }
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "hub listing returned HTTP {}",
                response.status()
            )));
        }

        let model: ApiModel = response
            .json()
            .await
            .context("parsing hub repository listing")?;
        Ok(model.siblings.into_iter().map(|s| s.rfilename).collect())
    }
}

fn urlencode(s: &str) -> String {
    // Query values here are model names; escape the handful of characters
    // that break a query string.
    s.replace('%', "%25")
        .replace('&', "%26")
        .replace('+', "%2B")
        .replace('#', "%23")
        .replace(' ', "%20")
}
