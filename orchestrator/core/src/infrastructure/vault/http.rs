// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Vault Client
//!
//! Talks to the secret service's REST API. Implements [`VaultClient`] as an
//! Anti-Corruption Layer: wire names stay in this file.
//!
//! # API Endpoints
//!
//! - `GET /secrets?compartmentId=..&vaultId=..[&name=..]` - List secrets
//! - `GET /secrets/{id}` - Get secret
//! - `POST /secrets` - Create secret
//! - `PUT /secrets/{id}` - New version, or promote a version to CURRENT
//! - `GET /secrets/{id}/versions` - List versions
//! - `GET /secretbundles/{id}?stage=..|versionNumber=..` - Read content
//! - `POST /secrets/{id}/actions/scheduleDeletion`
//! - `POST /secrets/{id}/actions/cancelDeletion`
//! - `POST /secrets/{id}/versions/{n}/actions/scheduleDeletion`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::domain::config::VaultConfig;
use crate::domain::secret::{
    Passphrase, SecretId, SecretLifecycle, SecretSummary, SecretVersion, VersionStage,
};
use crate::domain::vault::{
    CreateSecretRequest, SecretBundle, UpdateSecretRequest, VaultClient, VaultError, VaultTarget,
    VersionSelector,
};

const BASE64_CONTENT: &str = "BASE64";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretResource {
    id: String,
    secret_name: String,
    lifecycle_state: SecretLifecycle,
    #[serde(default)]
    current_version_number: Option<u64>,
}

impl From<SecretResource> for SecretSummary {
    fn from(resource: SecretResource) -> Self {
        Self {
            id: SecretId(resource.id),
            name: resource.secret_name,
            lifecycle: resource.lifecycle_state,
            current_version: resource.current_version_number,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionResource {
    version_number: u64,
    #[serde(default)]
    stages: Vec<VersionStage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleResource {
    version_number: u64,
    #[serde(default)]
    stages: Vec<VersionStage>,
    secret_bundle_content: BundleContent,
}

#[derive(Debug, Deserialize)]
struct BundleContent {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SecretContentBody {
    content_type: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<VersionStage>,
}

impl SecretContentBody {
    fn new(passphrase: &Passphrase, stage: Option<VersionStage>) -> Self {
        Self {
            content_type: BASE64_CONTENT,
            content: passphrase.to_vault_content().to_string(),
            stage,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSecretBody {
    compartment_id: String,
    vault_id: String,
    key_id: String,
    secret_name: String,
    defined_tags: BTreeMap<String, BTreeMap<String, String>>,
    secret_content: SecretContentBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSecretBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_content: Option<SecretContentBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_version_number: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleDeletionBody {
    time_of_deletion: DateTime<Utc>,
}

/// `namespace.key` tags become the service's nested defined-tag map.
fn defined_tags(tags: &BTreeMap<String, String>) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut nested: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (name, value) in tags {
        let (namespace, key) = name.split_once('.').unwrap_or(("default", name.as_str()));
        nested
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
    }
    nested
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VaultError::Timeout(err.to_string())
        } else if err.is_decode() {
            VaultError::InvalidResponse(err.to_string())
        } else {
            VaultError::Network(err.to_string())
        }
    }
}

pub struct HttpVaultClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpVaultClient {
    /// Build a client from config. The API token is read from the
    /// environment variable the config names; a missing token is allowed
    /// for endpoints that authenticate by instance principal.
    pub fn new(config: &VaultConfig) -> Result<Self, VaultError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| VaultError::Network(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: std::env::var(&config.token_env).ok().filter(|t| !t.is_empty()),
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response, what: &str) -> Result<Response, VaultError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| format!("HTTP {}", status));
        match status {
            StatusCode::NOT_FOUND => Err(VaultError::NotFound(what.to_string())),
            _ => Err(VaultError::Rejected {
                status: status.as_u16(),
                message,
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, VaultError> {
        let url = self.build_url(path);
        debug!("GET {}", url);
        let response = self
            .authorized(self.client.get(&url).query(query))
            .send()
            .await?;
        let response = Self::check(response, path).await?;
        response
            .json()
            .await
            .map_err(|e| VaultError::InvalidResponse(e.to_string()))
    }

    async fn post_action<B: Serialize>(&self, path: &str, body: Option<&B>) -> Result<(), VaultError> {
        let url = self.build_url(path);
        debug!("POST {}", url);
        let mut request = self.client.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.authorized(request).send().await?;
        Self::check(response, path).await?;
        Ok(())
    }
}

#[async_trait]
impl VaultClient for HttpVaultClient {
    async fn list_secrets(
        &self,
        target: &VaultTarget,
        name: Option<&str>,
    ) -> Result<Vec<SecretSummary>, VaultError> {
        let mut query = vec![
            ("compartmentId", target.compartment_id.clone()),
            ("vaultId", target.vault_id.clone()),
        ];
        if let Some(name) = name {
            query.push(("name", name.to_string()));
        }
        let secrets: Vec<SecretResource> = self.get_json("/secrets", &query).await?;
        Ok(secrets.into_iter().map(SecretSummary::from).collect())
    }

    async fn get_secret(&self, id: &SecretId) -> Result<SecretSummary, VaultError> {
        let secret: SecretResource = self.get_json(&format!("/secrets/{}", id), &[]).await?;
        Ok(secret.into())
    }

    async fn list_versions(&self, id: &SecretId) -> Result<Vec<SecretVersion>, VaultError> {
        let versions: Vec<VersionResource> = self
            .get_json(&format!("/secrets/{}/versions", id), &[])
            .await?;
        Ok(versions
            .into_iter()
            .map(|v| SecretVersion {
                number: v.version_number,
                stages: v.stages,
            })
            .collect())
    }

    async fn read_version(
        &self,
        id: &SecretId,
        selector: VersionSelector,
    ) -> Result<SecretBundle, VaultError> {
        let query = match selector {
            VersionSelector::Stage(stage) => {
                let stage = serde_json::to_value(stage)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                vec![("stage", stage)]
            }
            VersionSelector::Number(number) => vec![("versionNumber", number.to_string())],
        };
        let bundle: BundleResource = self
            .get_json(&format!("/secretbundles/{}", id), &query)
            .await?;
        let content = Passphrase::from_vault_content(&bundle.secret_bundle_content.content)
            .ok_or_else(|| {
                VaultError::InvalidResponse(format!("secret {} content is not base64", id))
            })?;
        Ok(SecretBundle {
            version_number: bundle.version_number,
            stages: bundle.stages,
            content,
        })
    }

    async fn create_secret(
        &self,
        request: CreateSecretRequest,
    ) -> Result<SecretSummary, VaultError> {
        let body = CreateSecretBody {
            compartment_id: request.target.compartment_id,
            vault_id: request.target.vault_id,
            key_id: request.key_id,
            secret_name: request.name,
            defined_tags: defined_tags(&request.tags),
            secret_content: SecretContentBody::new(&request.content, Some(VersionStage::Current)),
        };
        let url = self.build_url("/secrets");
        debug!("POST {} ({})", url, body.secret_name);
        let response = self
            .authorized(self.client.post(&url).json(&body))
            .send()
            .await?;
        let secret: SecretResource = Self::check(response, &body.secret_name)
            .await?
            .json()
            .await
            .map_err(|e| VaultError::InvalidResponse(e.to_string()))?;
        Ok(secret.into())
    }

    async fn update_secret(
        &self,
        id: &SecretId,
        request: UpdateSecretRequest,
    ) -> Result<SecretSummary, VaultError> {
        let body = UpdateSecretBody {
            secret_content: request
                .content
                .as_ref()
                .map(|p| SecretContentBody::new(p, None)),
            current_version_number: request.current_version_number,
        };
        let path = format!("/secrets/{}", id);
        let url = self.build_url(&path);
        debug!("PUT {}", url);
        let response = self
            .authorized(self.client.put(&url).json(&body))
            .send()
            .await?;
        let secret: SecretResource = Self::check(response, &path)
            .await?
            .json()
            .await
            .map_err(|e| VaultError::InvalidResponse(e.to_string()))?;
        Ok(secret.into())
    }

    async fn schedule_deletion(&self, id: &SecretId, at: DateTime<Utc>) -> Result<(), VaultError> {
        self.post_action(
            &format!("/secrets/{}/actions/scheduleDeletion", id),
            Some(&ScheduleDeletionBody {
                time_of_deletion: at,
            }),
        )
        .await
    }

    async fn cancel_deletion(&self, id: &SecretId) -> Result<(), VaultError> {
        self.post_action::<ScheduleDeletionBody>(
            &format!("/secrets/{}/actions/cancelDeletion", id),
            None,
        )
        .await
    }

    async fn schedule_version_deletion(
        &self,
        id: &SecretId,
        version_number: u64,
        at: DateTime<Utc>,
    ) -> Result<(), VaultError> {
        self.post_action(
            &format!(
                "/secrets/{}/versions/{}/actions/scheduleDeletion",
                id, version_number
            ),
            Some(&ScheduleDeletionBody {
                time_of_deletion: at,
            }),
        )
        .await
    }
}
