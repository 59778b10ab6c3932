//! Content-addressed uploads of image assets through an IPFS relay.

use crate::error::{Error, Result};
use crate::models::IpfsFile;
use crate::utils::truncate_for_log;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct IpfsUploader {
    client: Client,
    endpoint: String,
}

impl IpfsUploader {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Download `url` and re-upload its bytes to IPFS.
    #[instrument(level = "info", skip(self))]
    pub async fn upload_by_url(&self, url: &str) -> Result<IpfsFile> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Remote {
                service: "asset download",
                status: status.as_u16(),
                body: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;

        let mut part = Part::bytes(bytes.to_vec()).file_name(file_name(url));
        if let Some(mime) = mime {
            part = part.mime_str(&mime)?;
        }
        let response = self
            .client
            .put(&self.endpoint)
            .multipart(Form::new().part("file", part))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Remote {
                service: "ipfs relay",
                status: status.as_u16(),
                body: truncate_for_log(&response.text().await.unwrap_or_default(), 500),
            });
        }
        let file: IpfsFile = response.json().await?;
        info!(ipfs = %file.url, web2url = %file.web2url, "Uploaded asset to IPFS");
        Ok(file)
    }
}

/// Last path segment of `url` without the query, or `"file"`.
fn file_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "file".to_string())
}
