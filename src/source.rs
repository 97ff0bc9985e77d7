use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::item::AmiPushItem;

/// File listing the AMI descriptors inside a staging directory.
const STAGED_METADATA_FILE: &str = "staged.json";

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported source reference: {0}")]
    UnknownScheme(String),

    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: String },

    #[error("deserialize: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("source request failed, code: {status}, body: {body}")]
    Http { status: u16, body: String },

    #[error("source transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A source of push items: either a staging directory on disk or a pub task
/// reference served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Staged(PathBuf),
    Pub(String),
}

impl SourceRef {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if let Some(path) = raw.strip_prefix("staged:") {
            return Ok(SourceRef::Staged(PathBuf::from(path)));
        }
        if let Some(url) = raw.strip_prefix("pub:") {
            return Ok(SourceRef::Pub(url.to_string()));
        }
        Err(Error::UnknownScheme(raw.to_string()))
    }
}

/// Loads push items from all given source references, in order. Entries that
/// do not describe an AMI are dropped from the queue with a warning.
pub async fn load_items(sources: &[String]) -> Result<Vec<AmiPushItem>, Error> {
    let mut items = Vec::new();
    for raw in sources {
        match SourceRef::parse(raw)? {
            SourceRef::Staged(path) => {
                info!("Loading staged push items from {}", path.display());
                items.extend(load_staged(&path)?);
            }
            SourceRef::Pub(url) => {
                info!("Loading push items from {}", url);
                items.extend(load_pub(&url).await?);
            }
        }
    }
    debug!("{} push items loaded", items.len());
    Ok(items)
}

fn load_staged(dir: &Path) -> Result<Vec<AmiPushItem>, Error> {
    let path = dir.join(STAGED_METADATA_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|err| Error::ReadFile {
        err,
        path: path.display().to_string(),
    })?;
    let entries: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
    Ok(collect_ami_items(entries))
}

async fn load_pub(url: &str) -> Result<Vec<AmiPushItem>, Error> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let resp = client.get(url).send().await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Http {
            status: status.as_u16(),
            body,
        });
    }
    let entries: Vec<serde_json::Value> = resp.json().await?;
    Ok(collect_ami_items(entries))
}

fn collect_ami_items(entries: Vec<serde_json::Value>) -> Vec<AmiPushItem> {
    let mut items = Vec::new();
    for entry in entries {
        match serde_json::from_value::<AmiPushItem>(entry.clone()) {
            Ok(item) => items.push(item),
            Err(_) => {
                let name = entry
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<unnamed>");
                let src = entry
                    .get("src")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<unknown>");
                warn!(
                    "Push item {} at {} is not an AMI push item. Dropping it from the queue",
                    name, src
                );
            }
        }
    }
    items
}
