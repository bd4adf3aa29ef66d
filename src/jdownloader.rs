//! JDownloader handoff
//!
//! Thin client for the JDownloader 2 "deprecated direct connection" API on
//! the local machine. Links are queued in the link grabber without starting;
//! starting is a separate call.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::JDownloaderSettings;
use crate::database::JsonMap;

/// Delay between queueing links and starting, so the grabber has them.
const ADD_SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum JDownloaderError {
    #[error("No links provided")]
    NoLinks,

    #[error("Failed to reach JDownloader: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JDownloader returned status {status}: {body}")]
    Status { status: u16, body: String },
}

pub type JDownloaderResult<T> = Result<T, JDownloaderError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddLinksRequest<'a> {
    links: &'a [String],
    autostart: bool,
    auto_extract: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    package_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_folder: Option<&'a str>,
}

pub struct JDownloaderClient {
    http: Client,
    base_url: String,
}

impl JDownloaderClient {
    pub fn new(settings: &JDownloaderSettings) -> JDownloaderResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> JDownloaderResult<Response> {
        let response = self.http.get(self.url(path)).send().await?;
        debug!("GET {} -> {}", path, response.status());
        check(response).await
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> JDownloaderResult<Response> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        debug!("POST {} -> {}", path, response.status());
        check(response).await
    }

    pub async fn is_available(&self) -> bool {
        self.get("/flash/get/version").await.is_ok()
    }

    pub async fn version(&self) -> JDownloaderResult<String> {
        Ok(self.get("/flash/get/version").await?.text().await?)
    }

    /// Queue links in the link grabber. Nothing starts downloading.
    pub async fn add_links(
        &self,
        links: &[String],
        package_name: Option<&str>,
        destination: Option<&str>,
    ) -> JDownloaderResult<()> {
        if links.is_empty() {
            return Err(JDownloaderError::NoLinks);
        }
        let request = AddLinksRequest {
            links,
            autostart: false,
            auto_extract: false,
            package_name: package_name.filter(|name| !name.is_empty()),
            destination_folder: destination.filter(|dir| !dir.is_empty()),
        };
        self.post("/linkgrabberv2/addLinks", &request).await?;
        info!("📥 Sent {} links to JDownloader", links.len());
        Ok(())
    }

    pub async fn add_links_and_start(
        &self,
        links: &[String],
        package_name: Option<&str>,
        destination: Option<&str>,
    ) -> JDownloaderResult<()> {
        self.add_links(links, package_name, destination).await?;
        tokio::time::sleep(ADD_SETTLE_DELAY).await;
        self.start_downloads().await
    }

    pub async fn start_downloads(&self) -> JDownloaderResult<()> {
        self.get("/downloadcontroller/start").await?;
        Ok(())
    }

    pub async fn stop_downloads(&self) -> JDownloaderResult<()> {
        self.get("/downloadcontroller/stop").await?;
        Ok(())
    }

    pub async fn current_state(&self) -> JDownloaderResult<JsonMap> {
        Ok(self.get("/downloadcontroller/getCurrentState").await?.json().await?)
    }

    /// Every link in the download list with progress fields.
    pub async fn query_links(&self) -> JDownloaderResult<Vec<JsonMap>> {
        let query = json!({
            "bytesLoaded": true,
            "bytesTotal": true,
            "comment": true,
            "status": true,
            "enabled": true,
            "eta": true,
            "extractionStatus": true,
            "finished": true,
            "running": true,
            "speed": true,
            "url": true,
        });
        Ok(self.post("/downloadsV2/queryLinks", &query).await?.json().await?)
    }

    /// Drop finished links from the list.
    pub async fn clear_finished(&self) -> JDownloaderResult<()> {
        self.get("/downloadcontroller/cleanup/action/DELETE_ALL/mode/REMOVE_LINKS_ONLY/selection/FINISHED")
            .await?;
        Ok(())
    }
}

async fn check(response: Response) -> JDownloaderResult<Response> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(JDownloaderError::Status {
        status: status.as_u16(),
        body,
    })
}
