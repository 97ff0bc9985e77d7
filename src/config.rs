use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

/// An amipub.toml file.
#[derive(Deserialize, Debug)]
pub struct File {
    pub description: Option<String>,
    #[serde(default = "Default::default")]
    pub task: Task,
}

impl Default for File {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl File {
    pub fn from_path(path: &str) -> Result<Self, FileError> {
        let raw = std::fs::read_to_string(path).map_err(|err| FileError::Read {
            err,
            path: path.to_string(),
        })?;
        Ok(toml::from_str(&raw)?)
    }
}

#[derive(Error, Debug)]
pub enum FileError {
    #[error("read {path}: {err}")]
    Read { err: std::io::Error, path: String },

    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
}

#[serde_inline_default]
#[derive(Deserialize, Debug)]
pub struct Task {
    #[serde_inline_default("AWS".to_string())]
    pub provider: String,
    #[serde_inline_default("redhat-cloudimg".to_string())]
    pub container_prefix: String,
    #[serde_inline_default(4)]
    pub max_retries: u32,
    #[serde_inline_default(30)]
    pub retry_wait: u64,
    #[serde_inline_default(5)]
    pub request_threads: usize,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            provider: "AWS".to_string(),
            container_prefix: "redhat-cloudimg".to_string(),
            max_retries: 4,
            retry_wait: 30,
            request_threads: 5,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse accounts mapping: {0}")]
    ParseAccounts(#[from] serde_json::Error),

    #[error("no accounts configured for region {0} and no default accounts supplied")]
    NoAccounts(String),
}

/// One access/secret credential pair from the accounts mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsAccount {
    pub access_id: String,
    pub secret_key: String,
}

pub const DEFAULT_ACCOUNT_GROUP: &str = "default";

/// Region to accounts mapping, e.g.
/// `{"us-east-1": {"access-id": "secret"}, "default": {"access-id": "secret"}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountsMap(pub HashMap<String, HashMap<String, String>>);

impl AccountsMap {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        Ok(Self(serde_json::from_str(raw)?))
    }

    /// Accounts an image is pushed to or deleted from in the given region:
    /// the region-specific set when present, otherwise the default set. The
    /// default accounts are always included so snapshots stay shared with
    /// them.
    pub fn accounts_for(&self, region: &str) -> Result<Vec<AwsAccount>, Error> {
        let mut accounts = Vec::new();
        let groups = [self.0.get(region), self.0.get(DEFAULT_ACCOUNT_GROUP)];
        for group in groups.into_iter().flatten() {
            let mut ids: Vec<&String> = group.keys().collect();
            ids.sort();
            for access_id in ids {
                if accounts
                    .iter()
                    .any(|a: &AwsAccount| &a.access_id == access_id)
                {
                    continue;
                }
                accounts.push(AwsAccount {
                    access_id: access_id.clone(),
                    secret_key: group[access_id].clone(),
                });
            }
        }
        if accounts.is_empty() {
            return Err(Error::NoAccounts(region.to_string()));
        }
        Ok(accounts)
    }

    pub fn insert(&mut self, group: &str, access_id: String, secret_key: String) {
        self.0
            .entry(group.to_string())
            .or_default()
            .insert(access_id, secret_key);
    }
}

/// Region to snapshot-account-id list mapping, granting snapshot
/// create-volume permission when a new snapshot is created during push.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotAccounts(pub HashMap<String, Vec<String>>);

impl SnapshotAccounts {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        Ok(Self(serde_json::from_str(raw)?))
    }

    pub fn for_region(&self, region: &str) -> Vec<String> {
        self.0
            .get(region)
            .or_else(|| self.0.get(DEFAULT_ACCOUNT_GROUP))
            .cloned()
            .unwrap_or_default()
    }
}

/// Bounded retry with a fixed inter-attempt delay, applied to provider
/// actions only.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_wait_secs: u64) -> Self {
        Self {
            max_retries,
            retry_wait: Duration::from_secs(retry_wait_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, 30)
    }
}
