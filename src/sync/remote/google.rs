//! Google Drive v3 REST client

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, trace};

use super::api::{ChangePage, DriveApi, RemoteObject, FOLDER_MIME};
use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};
use crate::types::ByteStream;

const FILE_FIELDS: &str = "id,name,parents,mimeType,trashed,createdTime,modifiedTime";

/// Error reasons Drive uses for quota exhaustion
const RATE_LIMIT_REASONS: &[&str] = &["userRateLimitExceeded", "rateLimitExceeded"];
const RATE_LIMIT_MESSAGE: &str = "User Rate Limit Exceeded";

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteObject>,
}

/// Map a failed Drive response to an error
///
/// Quota errors (403 or 429 with a rate-limit reason or message, and any
/// 429) become [`SyncError::RateLimited`]; 404 becomes
/// [`SyncError::NotFound`].
pub fn classify_error(status: u16, body: &str) -> SyncError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let detail = parsed.error;
    let reason = detail
        .errors
        .iter()
        .map(|e| e.reason.as_str())
        .find(|r| RATE_LIMIT_REASONS.contains(r));

    let quota = status == 429
        || (status == 403 && (reason.is_some() || detail.message.contains(RATE_LIMIT_MESSAGE)));
    if quota {
        return SyncError::RateLimited {
            reason: reason.unwrap_or(RATE_LIMIT_MESSAGE).to_string(),
        };
    }

    let message = if detail.message.is_empty() {
        body.to_string()
    } else {
        detail.message
    };
    if status == 404 {
        return SyncError::NotFound(message);
    }
    SyncError::Remote { status, message }
}

/// Escape a value for a single-quoted Drive query literal
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Drive client authenticated with a bearer token
pub struct GoogleDriveClient {
    http: Client,
    api_base: String,
    upload_base: String,
    token: String,
}

impl GoogleDriveClient {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let token = config
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::Config("remote.access_token is not set".to_string()))?;
        let http = Client::builder()
            .user_agent(concat!("tandem-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            upload_base: config.upload_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        trace!(%status, url = %response.url(), "Drive response");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status.as_u16(), &body))
    }

    async fn send_optional(&self, request: RequestBuilder) -> Result<Option<Response>> {
        match self.send(request).await {
            Ok(response) => Ok(Some(response)),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DriveApi for GoogleDriveClient {
    async fn start_page_token(&self) -> Result<String> {
        let url = format!("{}/changes/startPageToken", self.api_base);
        let token: StartPageToken = self.send(self.request(Method::GET, &url)).await?.json().await?;
        Ok(token.start_page_token)
    }

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage> {
        let url = format!("{}/changes", self.api_base);
        let fields = format!("nextPageToken,newStartPageToken,changes(fileId,removed,time,file({FILE_FIELDS}))");
        let request = self.request(Method::GET, &url).query(&[
            ("pageToken", page_token),
            ("fields", fields.as_str()),
            ("includeRemoved", "true"),
        ]);
        let page: ChangePage = self.send(request).await?.json().await?;
        debug!(page_token, changes = page.changes.len(), "Listed drive changes");
        Ok(page)
    }

    async fn get(&self, id: &str) -> Result<Option<RemoteObject>> {
        let url = format!("{}/files/{}", self.api_base, id);
        let request = self
            .request(Method::GET, &url)
            .query(&[("fields", FILE_FIELDS)]);
        match self.send_optional(request).await? {
            Some(response) => Ok(Some(response.json().await?)),
            None => Ok(None),
        }
    }

    async fn find_child(&self, parent: &str, name: &str) -> Result<Option<RemoteObject>> {
        let url = format!("{}/files", self.api_base);
        let query = format!(
            "{} in parents and name = {} and trashed = false",
            quote(parent),
            quote(name)
        );
        let fields = format!("files({FILE_FIELDS})");
        let request = self.request(Method::GET, &url).query(&[
            ("q", query.as_str()),
            ("fields", fields.as_str()),
            ("pageSize", "1"),
        ]);
        let list: FileList = self.send(request).await?.json().await?;
        Ok(list.files.into_iter().next())
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteObject> {
        let url = format!("{}/files", self.api_base);
        let request = self
            .request(Method::POST, &url)
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({
                "name": name,
                "mimeType": FOLDER_MIME,
                "parents": [parent],
            }));
        Ok(self.send(request).await?.json().await?)
    }

    async fn create_empty_file(&self, parent: &str, name: &str) -> Result<RemoteObject> {
        let url = format!("{}/files", self.api_base);
        let request = self
            .request(Method::POST, &url)
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({
                "name": name,
                "parents": [parent],
            }));
        Ok(self.send(request).await?.json().await?)
    }

    async fn update_file(&self, id: &str, content: ByteStream) -> Result<RemoteObject> {
        let url = format!("{}/files/{}", self.upload_base, id);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(content));
        let request = self
            .request(Method::PATCH, &url)
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .body(body);
        Ok(self.send(request).await?.json().await?)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let url = format!("{}/files/{}", self.api_base, id);
        self.send(self.request(Method::DELETE, &url)).await?;
        Ok(())
    }

    async fn download(&self, id: &str) -> Result<Option<ByteStream>> {
        let url = format!("{}/files/{}", self.api_base, id);
        let request = self.request(Method::GET, &url).query(&[("alt", "media")]);
        let Some(response) = self.send_optional(request).await? else {
            return Ok(None);
        };
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Some(Box::new(tokio::io::empty())));
        }
        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        Ok(Some(Box::new(StreamReader::new(stream))))
    }
}
