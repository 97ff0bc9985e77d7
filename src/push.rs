use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};

use crate::catalog::{self, CatalogSync};
use crate::config::{self, AccountsMap, AwsAccount, RetryPolicy, SnapshotAccounts};
use crate::item::AmiPushItem;
use crate::manifest::{ItemOutcome, Manifest, OutcomeState};
use crate::provider::{with_retries, ImageDescriptor, ImageProvider};
use crate::rhsm::CatalogClient;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no push items to process")]
    NoPushItems,

    #[error("configuration: {0}")]
    Config(#[from] config::Error),

    #[error("catalog: {0}")]
    Catalog(#[from] catalog::Error),
}

/// States an (item, target) unit moves through. Uploading wraps the provider
/// call in the retry policy; Registering and Shipping are single attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Pending,
    Uploading,
    Registering,
    Shipping,
    Done,
    Failed,
}

/// One resolved (region, credentials) destination for a push item.
#[derive(Debug, Clone)]
pub struct PushTarget {
    pub region: String,
    pub account: AwsAccount,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub provider_name: String,
    pub container_prefix: String,
    pub ship: bool,
    pub allow_public_images: bool,
    pub retry: RetryPolicy,
    pub request_threads: usize,
}

/// Fans the per-item state machine out over all (item, target) pairs and
/// folds the outcomes into a single manifest. Pairs are independent: one
/// pair failing never aborts or hides another.
#[derive(Clone)]
pub struct PushEngine {
    provider: Arc<dyn ImageProvider>,
    catalog: Arc<dyn CatalogClient>,
    accounts: AccountsMap,
    snapshot_accounts: SnapshotAccounts,
    cfg: PushConfig,
    shutdown: watch::Receiver<bool>,
}

impl PushEngine {
    pub fn new(
        provider: Arc<dyn ImageProvider>,
        catalog: Arc<dyn CatalogClient>,
        accounts: AccountsMap,
        snapshot_accounts: SnapshotAccounts,
        cfg: PushConfig,
    ) -> Self {
        let (_tx, shutdown) = watch::channel(false);
        Self {
            provider,
            catalog,
            accounts,
            snapshot_accounts,
            cfg,
            shutdown,
        }
    }

    /// Units check the flag between steps and stop at the next safe
    /// checkpoint once it flips to true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn interrupted(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn run(&self, items: Vec<AmiPushItem>) -> Result<Manifest, Error> {
        if items.is_empty() {
            return Err(Error::NoPushItems);
        }

        let sync = Arc::new(CatalogSync::new(self.catalog.clone(), &self.cfg.provider_name).await?);
        sync.verify_items(&items)?;

        // Resolve all targets up front so account configuration errors abort
        // the run before any upload starts.
        let mut units = Vec::new();
        for item in items {
            let item = Arc::new(item);
            for region in &item.regions {
                for account in self.accounts.accounts_for(region)? {
                    units.push((
                        item.clone(),
                        PushTarget {
                            region: region.clone(),
                            account,
                        },
                    ));
                }
            }
        }
        if units.is_empty() {
            return Err(Error::NoPushItems);
        }

        let workers = self.cfg.request_threads.min(units.len()).max(1);
        info!(
            "Pushing {} (item, target) units with {} workers",
            units.len(),
            workers
        );
        let semaphore = Arc::new(Semaphore::new(workers));

        let mut handles = Vec::with_capacity(units.len());
        for (item, target) in units {
            let engine = self.clone();
            let sync = sync.clone();
            let semaphore = semaphore.clone();
            let handle = {
                let item = item.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.unwrap();
                    engine.push_one(&item, &target, &sync).await
                })
            };
            handles.push((item, target, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (item, target, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => outcomes.push(ItemOutcome {
                    src: item.src.clone(),
                    name: item.image_name(),
                    region: target.region,
                    account: target.account.access_id,
                    image_id: None,
                    snapshots: Vec::new(),
                    state: OutcomeState::Notpushed,
                    error: Some(format!("push task aborted: {}", err)),
                }),
            }
        }

        let manifest = Manifest::from_outcomes(outcomes);
        let (succeeded, failed) = manifest.counts();
        info!("AMI push finished: {} succeeded, {} failed", succeeded, failed);
        Ok(manifest)
    }

    /// Drives one (item, target) unit through
    /// Pending -> Uploading -> Registering -> (Shipping) -> Done,
    /// with any failure transitioning to Failed.
    async fn push_one(
        &self,
        item: &AmiPushItem,
        target: &PushTarget,
        sync: &CatalogSync,
    ) -> ItemOutcome {
        let name = item.image_name();
        let mut state = PushState::Pending;

        if self.interrupted() {
            warn!(
                "Skipping {} [{}]: shutdown requested",
                item.name, target.region
            );
            return fail(item, target, &name, None, state, "interrupted before upload");
        }

        advance(&mut state, PushState::Uploading, item, target);
        info!(
            "Uploading {} to region {} (type: {}, ship: {})",
            item.src,
            target.region,
            item.image_type.as_str(),
            self.cfg.ship
        );
        info!("Image name: {}", name);

        let descriptor = self.descriptor(item, target, Vec::new());
        let image = match with_retries(&self.cfg.retry, "upload", || {
            self.provider
                .create_or_reuse_image(&descriptor, &target.region, &target.account)
        })
        .await
        {
            Ok(image) => image,
            Err(err) => {
                error!(
                    "Upload of {} to {} failed: {}",
                    item.name, target.region, err
                );
                return fail(item, target, &name, None, state, err.to_string());
            }
        };
        info!(
            "Successfully uploaded {} [{}] [{}]",
            name, target.region, image.id
        );

        if self.interrupted() {
            return fail(
                item,
                target,
                &name,
                Some(image.id),
                state,
                "interrupted before catalog registration",
            );
        }

        advance(&mut state, PushState::Registering, item, target);
        if let Err(err) = sync.sync_image(item, &target.region, &image).await {
            error!(
                "Catalog update failed for {} [{}]: {}",
                image.id, target.region, err
            );
            return fail(item, target, &name, Some(image.id), state, err.to_string());
        }

        if self.cfg.ship && item.effective_public_image() && self.cfg.allow_public_images {
            if self.interrupted() {
                return fail(
                    item,
                    target,
                    &name,
                    Some(image.id),
                    state,
                    "interrupted before shipping",
                );
            }
            advance(&mut state, PushState::Shipping, item, target);
            info!("Releasing image {} publicly", image.id);
            let descriptor = self.descriptor(item, target, vec!["all".to_string()]);
            // A repeat publish only updates the launch permission groups
            if let Err(err) = self
                .provider
                .create_or_reuse_image(&descriptor, &target.region, &target.account)
                .await
            {
                error!(
                    "Public release of {} [{}] failed: {}",
                    image.id, target.region, err
                );
                return fail(item, target, &name, Some(image.id), state, err.to_string());
            }
        }

        advance(&mut state, PushState::Done, item, target);
        ItemOutcome {
            src: item.src.clone(),
            name,
            region: target.region.clone(),
            account: target.account.access_id.clone(),
            image_id: Some(image.id),
            snapshots: Vec::new(),
            state: OutcomeState::Pushed,
            error: None,
        }
    }

    /// Publishing metadata for one upload of the item to one target.
    fn descriptor(
        &self,
        item: &AmiPushItem,
        target: &PushTarget,
        groups: Vec<String>,
    ) -> ImageDescriptor {
        let name = item.image_name();
        ImageDescriptor {
            image_path: PathBuf::from(&item.src),
            image_name: name.clone(),
            snapshot_name: name,
            container: format!("{}-{}", self.cfg.container_prefix, target.region),
            description: item.description.clone(),
            arch: item.release.arch.clone(),
            virt_type: item.virtualization.clone(),
            root_device_name: item.root_device.clone(),
            volume_type: item.volume.clone(),
            boot_mode: item.boot_mode,
            billing_products: item.billing_codes.codes.clone(),
            snapshot_account_ids: self.snapshot_accounts.for_region(&target.region),
            sriov_net_support: item.sriov_net_support.clone(),
            ena_support: item.ena_support.unwrap_or(false),
            groups,
        }
    }
}

fn advance(state: &mut PushState, next: PushState, item: &AmiPushItem, target: &PushTarget) {
    debug!(
        "{} [{}/{}]: {:?} -> {:?}",
        item.name, target.region, target.account.access_id, state, next
    );
    *state = next;
}

fn fail(
    item: &AmiPushItem,
    target: &PushTarget,
    name: &str,
    image_id: Option<String>,
    state: PushState,
    error: impl Into<String>,
) -> ItemOutcome {
    debug!(
        "{} [{}/{}]: {:?} -> {:?}",
        item.name,
        target.region,
        target.account.access_id,
        state,
        PushState::Failed
    );
    ItemOutcome {
        src: item.src.clone(),
        name: name.to_string(),
        region: target.region.clone(),
        account: target.account.access_id.clone(),
        image_id,
        snapshots: Vec::new(),
        state: OutcomeState::Notpushed,
        error: Some(error.into()),
    }
}
