//! HTTP client for the identity service that owns user accounts. The chat
//! subsystem only replicates the slim profile it needs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use uuid::Uuid;

use agora_chat::ports::IdentityClient;
use agora_types::api::Profile;

pub struct HttpIdentityClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpIdentityClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn profile(&self, id: Uuid) -> Result<Option<Profile>> {
        let url = format!("{}/users/{id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("identity request failed")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let profile = response
            .error_for_status()
            .context("identity returned an error")?
            .json::<Profile>()
            .await
            .context("identity returned a malformed profile")?;
        Ok(Some(profile))
    }

    async fn profiles(&self, ids: &[Uuid]) -> Result<Vec<Profile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}/users?ids={joined}", self.base_url);
        let profiles = self
            .http
            .get(&url)
            .send()
            .await
            .context("identity request failed")?
            .error_for_status()
            .context("identity returned an error")?
            .json::<Vec<Profile>>()
            .await
            .context("identity returned a malformed profile list")?;
        Ok(profiles)
    }
}
