//! GitHub Gist provider.
//!
//! The payload is stored as a single file in a secret gist. The token is
//! read from local settings (`gist_token`) on every request.

use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(feature = "http")]
use serde::Deserialize;
use serde_json::json;
#[cfg(feature = "http")]
use tracing::debug;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{PomoflowError, Result};
use crate::settings::{LocalSettings, GIST_TOKEN_KEY};
use crate::sync::provider::{RemoteProvider, RemoteRef, SyncPayload};

/// Name of the file holding the payload inside the gist.
pub const GIST_FILE_NAME: &str = "pomoflow-sync.json";

const GIST_DESCRIPTION: &str = "Pomoflow sync data";

#[cfg(feature = "http")]
#[derive(Debug, Deserialize)]
struct GistResponse {
    id: String,
    html_url: Option<String>,
    #[serde(default)]
    files: std::collections::HashMap<String, GistFile>,
}

#[cfg(feature = "http")]
#[derive(Debug, Deserialize)]
struct GistFile {
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    raw_url: Option<String>,
}

pub struct GistProvider {
    base_url: String,
    settings: Rc<LocalSettings>,
    #[cfg(feature = "http")]
    client: reqwest::Client,
}

impl GistProvider {
    pub fn new(config: &ProviderConfig, timeout: Duration, settings: Rc<LocalSettings>) -> Result<Self> {
        #[cfg(not(feature = "http"))]
        let _ = timeout;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            settings,
            #[cfg(feature = "http")]
            client: crate::sync::http::client(ProviderKind::Gist.as_str(), timeout)?,
        })
    }

    fn token(&self) -> Result<String> {
        self.settings
            .get(GIST_TOKEN_KEY)
            .ok_or_else(|| PomoflowError::CredentialMissing {
                provider: ProviderKind::Gist.to_string(),
            })
    }

    fn body(payload: &SyncPayload) -> Result<serde_json::Value> {
        let content = serde_json::to_string_pretty(payload)?;
        Ok(json!({
            "description": GIST_DESCRIPTION,
            "public": false,
            "files": { GIST_FILE_NAME: { "content": content } },
        }))
    }

    #[cfg(feature = "http")]
    fn parse_payload(content: &str) -> Result<SyncPayload> {
        serde_json::from_str(content).map_err(|e| PomoflowError::RemoteFormat {
            provider: ProviderKind::Gist.to_string(),
            reason: format!("{}: {}", GIST_FILE_NAME, e),
        })
    }

    #[cfg(feature = "http")]
    fn request(&self, method: reqwest::Method, url: &str, token: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
    }

    #[cfg(feature = "http")]
    async fn send_upload(&self, existing: Option<&RemoteRef>, payload: &SyncPayload) -> Result<RemoteRef> {
        use crate::sync::http::{check_status, read_json, send_error};
        let provider = ProviderKind::Gist.as_str();
        let token = self.token()?;
        let body = Self::body(payload)?;

        let request = match existing {
            Some(remote) => {
                let url = format!("{}/gists/{}", self.base_url, remote.id);
                self.request(reqwest::Method::PATCH, &url, &token)
            }
            None => {
                let url = format!("{}/gists", self.base_url);
                self.request(reqwest::Method::POST, &url, &token)
            }
        };
        let response = request.json(&body).send().await.map_err(|e| send_error(provider, e))?;
        let gist: GistResponse = read_json(provider, check_status(provider, response)?).await?;
        debug!(gist = %gist.id, "Uploaded gist");
        Ok(RemoteRef {
            id: gist.id,
            url: gist.html_url,
        })
    }

    #[cfg(not(feature = "http"))]
    async fn send_upload(&self, _existing: Option<&RemoteRef>, payload: &SyncPayload) -> Result<RemoteRef> {
        self.token()?;
        Self::body(payload)?;
        Err(http_disabled())
    }

    #[cfg(feature = "http")]
    async fn fetch(&self, id: &str) -> Result<SyncPayload> {
        use crate::sync::http::{check_status, read_json, send_error};
        let provider = ProviderKind::Gist.as_str();
        let token = self.token()?;

        let url = format!("{}/gists/{}", self.base_url, id);
        let response = self
            .request(reqwest::Method::GET, &url, &token)
            .send()
            .await
            .map_err(|e| send_error(provider, e))?;
        let mut gist: GistResponse = read_json(provider, check_status(provider, response)?).await?;

        let file = gist
            .files
            .remove(GIST_FILE_NAME)
            .ok_or_else(|| PomoflowError::RemoteFormat {
                provider: provider.to_string(),
                reason: format!("gist {} has no {}", id, GIST_FILE_NAME),
            })?;

        let content = match (file.truncated, file.content, file.raw_url) {
            (false, Some(content), _) => content,
            (_, _, Some(raw_url)) => {
                debug!(gist = %id, "Gist content truncated, fetching raw file");
                let response = self
                    .request(reqwest::Method::GET, &raw_url, &token)
                    .send()
                    .await
                    .map_err(|e| send_error(provider, e))?;
                check_status(provider, response)?
                    .text()
                    .await
                    .map_err(|e| send_error(provider, e))?
            }
            _ => {
                return Err(PomoflowError::RemoteFormat {
                    provider: provider.to_string(),
                    reason: format!("gist {} file has no content", id),
                })
            }
        };
        Self::parse_payload(&content)
    }

    #[cfg(not(feature = "http"))]
    async fn fetch(&self, _id: &str) -> Result<SyncPayload> {
        self.token()?;
        Err(http_disabled())
    }
}

#[cfg(not(feature = "http"))]
fn http_disabled() -> PomoflowError {
    PomoflowError::Network {
        provider: ProviderKind::Gist.to_string(),
        message: "HTTP support not compiled. Build with --features http".to_string(),
    }
}

#[async_trait(?Send)]
impl RemoteProvider for GistProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gist
    }

    fn has_credential(&self) -> bool {
        self.token().is_ok()
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
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, token: Option<&str>) -> GistProvider {
        let settings = Rc::new(LocalSettings::in_memory());
        if let Some(token) = token {
            settings.set(GIST_TOKEN_KEY, token).unwrap();
        }
        let config = ProviderConfig {
            enabled: true,
            base_url: server.uri(),
        };
        GistProvider::new(&config, Duration::from_secs(5), settings).unwrap()
    }

    fn payload() -> SyncPayload {
        SyncPayload {
            version: PAYLOAD_VERSION,
            timestamp: Utc::now(),
            device_id: "dev-1".to_string(),
            device_name: "Linux (test)".to_string(),
            tasks: vec![json!({"id": "t1"})],
            projects: Vec::new(),
            settings: json!({}),
        }
    }

    #[tokio::test]
    async fn test_first_upload_creates_secret_gist() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gists"))
            .and(header("authorization", "Bearer ghp_test"))
            .and(body_partial_json(json!({"public": false})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "abc123",
                "html_url": "https://gist.github.com/abc123",
                "files": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let remote = provider(&server, Some("ghp_test"))
            .upload(None, &payload())
            .await
            .unwrap();
        assert_eq!(remote.id, "abc123");
        assert_eq!(remote.url.as_deref(), Some("https://gist.github.com/abc123"));
    }

    #[tokio::test]
    async fn test_later_uploads_patch_the_same_gist() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/gists/abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc123",
                "html_url": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let existing = RemoteRef {
            id: "abc123".to_string(),
            url: None,
        };
        let remote = provider(&server, Some("ghp_test"))
            .upload(Some(&existing), &payload())
            .await
            .unwrap();
        assert_eq!(remote.id, "abc123");
    }

    #[tokio::test]
    async fn test_download_follows_truncated_raw_url() {
        let server = MockServer::start().await;
        let sent = payload();
        Mock::given(method("GET"))
            .and(path("/gists/abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc123",
                "files": {
                    GIST_FILE_NAME: {
                        "content": "{\"vers",
                        "truncated": true,
                        "raw_url": format!("{}/raw/abc123", server.uri())
                    }
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/raw/abc123"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(serde_json::to_string(&sent).unwrap()),
            )
            .mount(&server)
            .await;

        let received = provider(&server, Some("ghp_test"))
            .download("abc123")
            .await
            .unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_missing_token_makes_no_request() {
        let server = MockServer::start().await;
        let gist = provider(&server, None);

        assert!(!gist.has_credential());
        let result = gist.upload(None, &payload()).await;
        assert!(matches!(result, Err(PomoflowError::CredentialMissing { .. })));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gists/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = provider(&server, Some("ghp_test")).download("gone").await;
        assert!(matches!(
            result,
            Err(PomoflowError::RemoteStatus { status: 404, .. })
        ));
    }
}
