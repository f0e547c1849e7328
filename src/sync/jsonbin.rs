//! JSONBin.io provider.
//!
//! The payload is the bin's record. Authenticated with the master key from
//! local settings (`jsonbin_api_key`).

use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(feature = "http")]
use serde::Deserialize;
#[cfg(feature = "http")]
use tracing::debug;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{PomoflowError, Result};
use crate::settings::{LocalSettings, JSONBIN_KEY_KEY};
use crate::sync::provider::{RemoteProvider, RemoteRef, SyncPayload};

const BIN_NAME: &str = "pomoflow-sync";

#[cfg(feature = "http")]
#[derive(Debug, Deserialize)]
struct BinResponse<T> {
    record: T,
    #[serde(default)]
    metadata: BinMetadata,
}

#[cfg(feature = "http")]
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinMetadata {
    id: Option<String>,
    parent_id: Option<String>,
}

pub struct JsonBinProvider {
    base_url: String,
    settings: Rc<LocalSettings>,
    #[cfg(feature = "http")]
    client: reqwest::Client,
}

impl JsonBinProvider {
    pub fn new(config: &ProviderConfig, timeout: Duration, settings: Rc<LocalSettings>) -> Result<Self> {
        #[cfg(not(feature = "http"))]
        let _ = timeout;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            settings,
            #[cfg(feature = "http")]
            client: crate::sync::http::client(ProviderKind::JsonBin.as_str(), timeout)?,
        })
    }

    fn master_key(&self) -> Result<String> {
        self.settings
            .get(JSONBIN_KEY_KEY)
            .ok_or_else(|| PomoflowError::CredentialMissing {
                provider: ProviderKind::JsonBin.to_string(),
            })
    }

    fn bin_url(&self, id: &str) -> String {
        format!("{}/b/{}", self.base_url, id)
    }
}

#[cfg(feature = "http")]
impl JsonBinProvider {
    async fn send_upload(&self, existing: Option<&RemoteRef>, payload: &SyncPayload) -> Result<RemoteRef> {
        use crate::sync::http::{check_status, read_json, send_error};
        let provider = ProviderKind::JsonBin.as_str();
        let key = self.master_key()?;

        let request = match existing {
            Some(remote) => self.client.put(self.bin_url(&remote.id)),
            None => self
                .client
                .post(format!("{}/b", self.base_url))
                .header("X-Bin-Private", "true")
                .header("X-Bin-Name", BIN_NAME),
        };
        let response = request
            .header("X-Master-Key", key)
            .json(payload)
            .send()
            .await
            .map_err(|e| send_error(provider, e))?;
        let bin: BinResponse<serde_json::Value> =
            read_json(provider, check_status(provider, response)?).await?;

        let id = match existing {
            Some(remote) => remote.id.clone(),
            None => bin
                .metadata
                .id
                .or(bin.metadata.parent_id)
                .ok_or_else(|| PomoflowError::RemoteFormat {
                    provider: provider.to_string(),
                    reason: "created bin has no id".to_string(),
                })?,
        };
        debug!(bin = %id, "Uploaded bin");
        Ok(RemoteRef {
            url: Some(self.bin_url(&id)),
            id,
        })
    }

    async fn fetch(&self, id: &str) -> Result<SyncPayload> {
        use crate::sync::http::{check_status, read_json, send_error};
        let provider = ProviderKind::JsonBin.as_str();
        let key = self.master_key()?;

        let response = self
            .client
            .get(format!("{}/latest", self.bin_url(id)))
            .header("X-Master-Key", key)
            .send()
            .await
            .map_err(|e| send_error(provider, e))?;
        let bin: BinResponse<SyncPayload> =
            read_json(provider, check_status(provider, response)?).await?;
        Ok(bin.record)
    }
}

#[cfg(not(feature = "http"))]
impl JsonBinProvider {
    async fn send_upload(&self, _existing: Option<&RemoteRef>, _payload: &SyncPayload) -> Result<RemoteRef> {
        self.master_key()?;
        Err(http_disabled())
    }

    async fn fetch(&self, id: &str) -> Result<SyncPayload> {
        self.master_key()?;
        let _ = self.bin_url(id);
        Err(http_disabled())
    }
}

#[cfg(not(feature = "http"))]
fn http_disabled() -> PomoflowError {
    PomoflowError::Network {
        provider: ProviderKind::JsonBin.to_string(),
        message: "HTTP support not compiled. Build with --features http".to_string(),
    }
}

#[async_trait(?Send)]
impl RemoteProvider for JsonBinProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::JsonBin
    }

    fn has_credential(&self) -> bool {
        self.master_key().is_ok()
    }

    async fn upload(&self, existing: Option<&RemoteRef>, payload: &SyncPayload) -> Result<RemoteRef> {
        self.send_upload(existing, payload).await
    }

    async fn download(&self, id: &str) -> Result<SyncPayload> {
        self.fetch(id).await
    }
}

#[cfg(all(test, feature = "http"))]
mod tests {
    use super::*;
    use crate::sync::provider::PAYLOAD_VERSION;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> JsonBinProvider {
        let settings = Rc::new(LocalSettings::in_memory());
        settings.set(JSONBIN_KEY_KEY, "$2b$master").unwrap();
        let config = ProviderConfig {
            enabled: true,
            base_url: server.uri(),
        };
        JsonBinProvider::new(&config, Duration::from_secs(5), settings).unwrap()
    }

    fn payload() -> SyncPayload {
        SyncPayload {
            version: PAYLOAD_VERSION,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            device_id: "dev-1".to_string(),
            device_name: "macOS (studio)".to_string(),
            tasks: Vec::new(),
            projects: vec![json!({"id": "p1", "name": "Thesis"})],
            settings: json!({"pomodoroMinutes": 25}),
        }
    }

    #[tokio::test]
    async fn test_create_private_bin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/b"))
            .and(header("X-Master-Key", "$2b$master"))
            .and(header("X-Bin-Private", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "record": {},
                "metadata": {"id": "65f0c1", "private": true}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let remote = provider(&server).upload(None, &payload()).await.unwrap();
        assert_eq!(remote.id, "65f0c1");
        assert_eq!(remote.url, Some(format!("{}/b/65f0c1", server.uri())));
    }

    #[tokio::test]
    async fn test_update_keeps_bin_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/b/65f0c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "record": {},
                "metadata": {"parentId": "65f0c1"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let existing = RemoteRef {
            id: "65f0c1".to_string(),
            url: None,
        };
        let remote = provider(&server)
            .upload(Some(&existing), &payload())
            .await
            .unwrap();
        assert_eq!(remote.id, "65f0c1");
    }

    #[tokio::test]
    async fn test_download_latest_record() {
        let server = MockServer::start().await;
        let sent = payload();
        Mock::given(method("GET"))
            .and(path("/b/65f0c1/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "record": sent,
                "metadata": {"id": "65f0c1"}
            })))
            .mount(&server)
            .await;

        let received = provider(&server).download("65f0c1").await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_unreadable_record_is_a_format_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/b/65f0c1/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let result = provider(&server).download("65f0c1").await;
        assert!(matches!(result, Err(PomoflowError::RemoteFormat { .. })));
    }
}
