// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Object Store Client
//!
//! Data keys come from the KMS crypto endpoint named in each
//! [`ObjectStoreLocation`]; objects live under the configured object
//! storage endpoint.
//!
//! # API Endpoints
//!
//! - `POST {kms}/20180608/generateDataEncryptionKey` - New wrapped data key
//! - `HEAD /n/{namespace}/b/{bucket}/o/{name}` - Object exists
//! - `PUT /n/{namespace}/b/{bucket}/o/{name}` - Create or replace object
//! - `DELETE /n/{namespace}/b/{bucket}/o/{name}` - Delete object

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::domain::config::ObjectStoreConfig;
use crate::domain::object_store::{DataKey, ObjectStoreError, ObjectStoreKeyClient, DATA_KEY_BYTES};
use crate::domain::secret::ObjectStoreLocation;

const GENERATE_DATA_KEY_PATH: &str = "/20180608/generateDataEncryptionKey";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateKeyBody<'a> {
    key_id: &'a str,
    include_plaintext_key: bool,
    key_shape: KeyShape,
}

#[derive(Serialize)]
struct KeyShape {
    algorithm: &'static str,
    length: usize,
}

#[derive(Deserialize)]
struct GeneratedKeyResource {
    ciphertext: String,
    #[serde(default)]
    plaintext: Option<String>,
}

impl From<reqwest::Error> for ObjectStoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ObjectStoreError::Timeout(err.to_string())
        } else if err.is_decode() {
            ObjectStoreError::InvalidResponse(err.to_string())
        } else {
            ObjectStoreError::Network(err.to_string())
        }
    }
}

pub struct HttpObjectStoreClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpObjectStoreClient {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self, ObjectStoreError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ObjectStoreError::Network(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: std::env::var(&config.token_env).ok().filter(|t| !t.is_empty()),
        })
    }

    fn object_url(&self, location: &ObjectStoreLocation, name: &str) -> String {
        format!(
            "{}/n/{}/b/{}/o/{}",
            self.endpoint, location.namespace, location.bucket, name
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response, what: &str) -> Result<Response, ObjectStoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| format!("HTTP {}", status));
        match status {
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound(what.to_string())),
            _ => Err(ObjectStoreError::Rejected {
                status: status.as_u16(),
                message,
            }),
        }
    }
}

#[async_trait]
impl ObjectStoreKeyClient for HttpObjectStoreClient {
    async fn generate_data_key(&self, location: &ObjectStoreLocation) -> Result<DataKey, ObjectStoreError> {
        let url = format!(
            "{}{}",
            location.kms_crypto_endpoint.trim_end_matches('/'),
            GENERATE_DATA_KEY_PATH
        );
        debug!("POST {}", url);
        let body = GenerateKeyBody {
            key_id: &location.kms_key_id,
            include_plaintext_key: true,
            key_shape: KeyShape {
                algorithm: "AES",
                length: DATA_KEY_BYTES,
            },
        };
        let response = self.authorized(self.client.post(&url).json(&body)).send().await?;
        let key: GeneratedKeyResource = Self::check(response, &location.kms_key_id)
            .await?
            .json()
            .await
            .map_err(|e| ObjectStoreError::InvalidResponse(e.to_string()))?;

        let plaintext = key
            .plaintext
            .ok_or_else(|| ObjectStoreError::InvalidResponse("data key without plaintext".to_string()))?;
        let plaintext = Zeroizing::new(
            STANDARD
                .decode(plaintext.trim())
                .map_err(|e| ObjectStoreError::InvalidResponse(format!("data key is not base64: {}", e)))?,
        );
        if plaintext.len() != DATA_KEY_BYTES {
            return Err(ObjectStoreError::InvalidResponse(format!(
                "data key is {} bytes, expected {}",
                plaintext.len(),
                DATA_KEY_BYTES
            )));
        }
        Ok(DataKey {
            ciphertext: key.ciphertext,
            plaintext,
        })
    }

    async fn object_exists(&self, location: &ObjectStoreLocation, name: &str) -> Result<bool, ObjectStoreError> {
        let url = self.object_url(location, name);
        debug!("HEAD {}", url);
        let response = self.authorized(self.client.head(&url)).send().await?;
        match Self::check(response, name).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn put_object(
        &self,
        location: &ObjectStoreLocation,
        name: &str,
        body: Vec<u8>,
    ) -> Result<(), ObjectStoreError> {
        let url = self.object_url(location, name);
        debug!("PUT {}", url);
        let response = self
            .authorized(
                self.client
                    .put(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body),
            )
            .send()
            .await?;
        Self::check(response, name).await?;
        Ok(())
    }

    async fn delete_object(&self, location: &ObjectStoreLocation, name: &str) -> Result<(), ObjectStoreError> {
        let url = self.object_url(location, name);
        debug!("DELETE {}", url);
        let response = self.authorized(self.client.delete(&url)).send().await?;
        Self::check(response, name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(url: String) -> HttpObjectStoreClient {
        let config = ObjectStoreConfig {
            endpoint: url,
            token_env: "FLEETCRYPT_TEST_UNSET_TOKEN".to_string(),
            ..ObjectStoreConfig::default()
        };
        HttpObjectStoreClient::new(&config).unwrap()
    }

    fn location(kms: String) -> ObjectStoreLocation {
        ObjectStoreLocation {
            bucket: "fs-keys".into(),
            namespace: "tenancy".into(),
            kms_key_id: "ocid1.key.oc1.test.master".into(),
            kms_crypto_endpoint: kms,
        }
    }

    #[tokio::test]
    async fn test_generate_data_key_asks_for_aes_256_with_plaintext() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", GENERATE_DATA_KEY_PATH)
            .match_body(Matcher::PartialJsonString(
                r#"{"keyId":"ocid1.key.oc1.test.master","includePlaintextKey":true,"keyShape":{"algorithm":"AES","length":32}}"#
                    .to_string(),
            ))
            .with_status(200)
            .with_body(format!(
                r#"{{"ciphertext":"wrapped==","plaintext":"{}"}}"#,
                STANDARD.encode([9u8; DATA_KEY_BYTES])
            ))
            .create_async()
            .await;

        let key = client(server.url())
            .generate_data_key(&location(server.url()))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(key.ciphertext, "wrapped==");
        assert_eq!(key.plaintext.as_slice(), &[9u8; DATA_KEY_BYTES]);
    }

    #[tokio::test]
    async fn test_short_data_key_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", GENERATE_DATA_KEY_PATH)
            .with_status(200)
            .with_body(format!(
                r#"{{"ciphertext":"w","plaintext":"{}"}}"#,
                STANDARD.encode([1u8; 16])
            ))
            .create_async()
            .await;

        let err = client(server.url())
            .generate_data_key(&location(server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_object_paths_and_statuses() {
        let mut server = mockito::Server::new_async().await;
        let path = "/n/tenancy/b/fs-keys/o/vm01.example.com";
        server.mock("HEAD", path).with_status(404).create_async().await;
        let put = server
            .mock("PUT", path)
            .match_body(r#"{"encDEK":"w","encData":"x"}"#)
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("DELETE", path)
            .with_status(409)
            .with_body("Conflict")
            .create_async()
            .await;

        let client = client(server.url());
        let location = location(server.url());
        assert!(!client.object_exists(&location, "vm01.example.com").await.unwrap());
        client
            .put_object(&location, "vm01.example.com", br#"{"encDEK":"w","encData":"x"}"#.to_vec())
            .await
            .unwrap();
        put.assert_async().await;

        let err = client
            .delete_object(&location, "vm01.example.com")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ObjectStoreError::Rejected {
                status: 409,
                message: "Conflict".into()
            }
        );
        assert!(!err.is_retryable());
    }
}
