use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{error, info, warn};
use thiserror::Error;

use crate::config::{AwsAccount, RetryPolicy};
use crate::item::BootMode;

/// Publishing metadata for one image upload to one region/account.
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub image_path: PathBuf,
    pub image_name: String,
    pub snapshot_name: String,
    /// Storage container the image bits are staged in before import.
    pub container: String,
    pub description: String,
    pub arch: String,
    pub virt_type: String,
    pub root_device_name: String,
    pub volume_type: String,
    pub boot_mode: Option<BootMode>,
    pub billing_products: Vec<String>,
    /// Account ids granted create-volume permission on the backing snapshot.
    pub snapshot_account_ids: Vec<String>,
    pub sriov_net_support: Option<String>,
    pub ena_support: bool,
    /// Launch permission groups, e.g. "all" for a public release.
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub id: String,
    pub name: String,
}

/// Result of an image deletion: the id actually removed (None when the image
/// was already gone) and the backing snapshot ids discovered before
/// deregistration.
#[derive(Debug, Clone, Default)]
pub struct DeletedImage {
    pub image_id: Option<String>,
    pub snapshot_ids: Vec<String>,
}

/// Provider failures, classified for the retry policy. Rate limits and
/// network blips are transient; permission and malformed-request errors are
/// terminal for the target.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider error: {0}")]
    Terminal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Cloud-provider collaborator surface consumed by the push and delete
/// engines. Implementations must be safe to call again with the same
/// descriptor: an image that already exists under the derived name is an
/// "already present" success, not an error.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn create_or_reuse_image(
        &self,
        descriptor: &ImageDescriptor,
        region: &str,
        account: &AwsAccount,
    ) -> Result<UploadedImage, ProviderError>;

    async fn delete_image(
        &self,
        region: &str,
        account: &AwsAccount,
        image_id: &str,
        image_name: &str,
    ) -> Result<DeletedImage, ProviderError>;

    async fn delete_snapshot(
        &self,
        region: &str,
        account: &AwsAccount,
        snapshot_id: &str,
    ) -> Result<Option<String>, ProviderError>;
}

/// Runs a provider action under the bounded retry policy. Only transient
/// errors are retried; the delay between attempts is the configured wait.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut retries = policy.max_retries;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retries > 0 => {
                retries -= 1;
                warn!("{}", err);
                info!("Retrying {} ({} retries left)", what, retries);
                tokio::time::sleep(policy.retry_wait).await;
            }
            Err(err) => {
                if err.is_transient() {
                    error!(
                        "{} failed after {} attempts. Giving up",
                        what,
                        policy.max_retries + 1
                    );
                }
                return Err(err);
            }
        }
    }
}
