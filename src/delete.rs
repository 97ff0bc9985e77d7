use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};

use crate::catalog::{self, CatalogSync};
use crate::config::{self, AccountsMap, RetryPolicy};
use crate::item::AmiPushItem;
use crate::manifest::{ItemOutcome, Manifest, OutcomeState};
use crate::provider::{with_retries, ImageProvider};
use crate::push::PushTarget;
use crate::rhsm::CatalogClient;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] config::Error),

    #[error("catalog: {0}")]
    Catalog(#[from] catalog::Error),

    #[error("list catalog images: {0}")]
    ListImages(#[from] crate::rhsm::CatalogError),
}

#[derive(Debug, Clone)]
pub struct DeleteConfig {
    pub provider_name: String,
    /// Skip destructive actions on the catalog and the provider.
    pub dry_run: bool,
    /// Leave backing snapshots in place after image deletion.
    pub keep_snapshot: bool,
    /// When set, only the named image ids are deleted.
    pub limit: Option<Vec<String>>,
    pub retry: RetryPolicy,
    pub request_threads: usize,
}

/// Mirror of the push flow: the catalog record is made invisible first so
/// user-facing discovery stops immediately, then the image and its backing
/// snapshots are removed from the provider.
#[derive(Clone)]
pub struct DeleteEngine {
    provider: Arc<dyn ImageProvider>,
    catalog: Arc<dyn CatalogClient>,
    accounts: AccountsMap,
    cfg: DeleteConfig,
    shutdown: watch::Receiver<bool>,
}

impl DeleteEngine {
    pub fn new(
        provider: Arc<dyn ImageProvider>,
        catalog: Arc<dyn CatalogClient>,
        accounts: AccountsMap,
        cfg: DeleteConfig,
    ) -> Self {
        let (_tx, shutdown) = watch::channel(false);
        Self {
            provider,
            catalog,
            accounts,
            cfg,
            shutdown,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn interrupted(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn limit_items(&self, items: Vec<AmiPushItem>) -> Vec<AmiPushItem> {
        match &self.cfg.limit {
            None => items,
            Some(limit) => items
                .into_iter()
                .filter(|item| {
                    item.image_id
                        .as_ref()
                        .map(|id| limit.contains(id))
                        .unwrap_or(false)
                })
                .collect(),
        }
    }

    pub async fn run(&self, items: Vec<AmiPushItem>) -> Result<Manifest, Error> {
        let items = self.limit_items(items);
        if items.is_empty() {
            info!("No AMI image selected for deletion");
            return Ok(Manifest::default());
        }

        let sync = Arc::new(CatalogSync::new(self.catalog.clone(), &self.cfg.provider_name).await?);

        // Soft-delete in the catalog first. A failure here is recorded but
        // does not stop the provider-side deletion, to avoid orphaned
        // storage.
        let catalog_errors = self.mark_items_invisible(&items, &sync).await?;

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

        let workers = self.cfg.request_threads.min(units.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(units.len());
        for (item, target) in units {
            let engine = self.clone();
            let catalog_error = catalog_errors.get(&item.src).cloned();
            let semaphore = semaphore.clone();
            let handle = {
                let item = item.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.unwrap();
                    engine.delete_one(&item, &target, catalog_error).await
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
                    image_id: item.image_id.clone(),
                    snapshots: Vec::new(),
                    state: OutcomeState::Notdeleted,
                    error: Some(format!("delete task aborted: {}", err)),
                }),
            }
        }

        let manifest = Manifest::from_outcomes(outcomes);
        let (succeeded, failed) = manifest.counts();
        info!(
            "AMI delete finished: {} succeeded, {} failed",
            succeeded, failed
        );
        Ok(manifest)
    }

    /// Marks every targeted image invisible in the catalog, if it is known
    /// there. A missing image is a warning, not an error. Returns the
    /// per-item failures for the result aggregation.
    async fn mark_items_invisible(
        &self,
        items: &[AmiPushItem],
        sync: &CatalogSync,
    ) -> Result<HashMap<String, String>, Error> {
        let known_ids = self.catalog.list_image_ids().await?;
        let mut failures = HashMap::new();

        for item in items {
            let Some(image_id) = &item.image_id else {
                warn!(
                    "Push item {} carries no image id, skipping catalog update",
                    item.name
                );
                continue;
            };
            if !known_ids.contains(image_id) {
                warn!(
                    "AMI image: {} not found, skipping update in the catalog",
                    image_id
                );
                continue;
            }
            if self.cfg.dry_run {
                info!("Would have updated image {} in the catalog", image_id);
                continue;
            }
            info!(
                "Attempting to update the existing image {} in the catalog",
                image_id
            );
            match sync.mark_invisible(item, image_id).await {
                Ok(()) => info!(
                    "Existing image {} successfully updated in the catalog",
                    image_id
                ),
                Err(err) => {
                    error!("Failed updating image {} in the catalog: {}", image_id, err);
                    failures.insert(item.src.clone(), err.to_string());
                }
            }
        }
        Ok(failures)
    }

    /// Deletes one image (and unless configured otherwise its snapshots) on
    /// the provider for one target.
    async fn delete_one(
        &self,
        item: &AmiPushItem,
        target: &PushTarget,
        catalog_error: Option<String>,
    ) -> ItemOutcome {
        let name = item.image_name();
        let outcome = |state, image_id, snapshots, error| ItemOutcome {
            src: item.src.clone(),
            name: name.clone(),
            region: target.region.clone(),
            account: target.account.access_id.clone(),
            image_id,
            snapshots,
            state,
            error,
        };

        let Some(image_id) = item.image_id.clone() else {
            warn!("Push item {} carries no image id, nothing to delete", item.name);
            return outcome(OutcomeState::Missing, None, Vec::new(), None);
        };

        if self.cfg.dry_run {
            info!(
                "Would have deleted image {} and related snapshot in AWS ({})",
                image_id, self.cfg.provider_name
            );
            return outcome(OutcomeState::Skipped, Some(image_id), Vec::new(), None);
        }

        if self.interrupted() {
            let mut errors = vec!["interrupted before delete".to_string()];
            if let Some(catalog_error) = catalog_error {
                errors.insert(0, format!("catalog: {}", catalog_error));
            }
            return outcome(
                OutcomeState::Notdeleted,
                Some(image_id),
                Vec::new(),
                Some(errors.join("; ")),
            );
        }

        info!(
            "Attempting to delete image {} and related snapshot on AWS ({})",
            name, self.cfg.provider_name
        );
        let mut errors = Vec::new();
        let mut deleted_snapshots = Vec::new();
        let mut deleted_image = None;

        match with_retries(&self.cfg.retry, "delete image", || {
            self.provider
                .delete_image(&target.region, &target.account, &image_id, &name)
        })
        .await
        {
            Ok(deleted) => {
                if let Some(id) = &deleted.image_id {
                    info!(
                        "Successfully deleted image: {} [{}] [{}]",
                        name, target.region, id
                    );
                }
                deleted_image = deleted.image_id;
                if !self.cfg.keep_snapshot {
                    for snapshot_id in &deleted.snapshot_ids {
                        match with_retries(&self.cfg.retry, "delete snapshot", || {
                            self.provider.delete_snapshot(
                                &target.region,
                                &target.account,
                                snapshot_id,
                            )
                        })
                        .await
                        {
                            Ok(Some(id)) => {
                                info!(
                                    "Successfully deleted snapshot: {} [{}] [{}]",
                                    name, target.region, id
                                );
                                deleted_snapshots.push(id);
                            }
                            Ok(None) => {}
                            Err(err) => {
                                error!(
                                    "Snapshot delete failed for {} [{}]: {}",
                                    snapshot_id, target.region, err
                                );
                                errors.push(format!("snapshot {}: {}", snapshot_id, err));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                error!("AWS delete failed for AMI {}: {}", image_id, err);
                errors.push(err.to_string());
            }
        }

        if let Some(catalog_error) = catalog_error {
            errors.insert(0, format!("catalog: {}", catalog_error));
        }

        let state = if !errors.is_empty() {
            OutcomeState::Notdeleted
        } else if deleted_image.is_some() || !deleted_snapshots.is_empty() {
            OutcomeState::Deleted
        } else {
            OutcomeState::Missing
        };
        let error = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };
        outcome(state, deleted_image, deleted_snapshots, error)
    }
}
