#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;

use amipub::config::{AccountsMap, AwsAccount, RetryPolicy, SnapshotAccounts};
use amipub::delete::DeleteConfig;
use amipub::item::{AmiPushItem, BillingCodes, ImageType, Release};
use amipub::provider::{
    DeletedImage, ImageDescriptor, ImageProvider, ProviderError, UploadedImage,
};
use amipub::push::PushConfig;
use amipub::rhsm::{CatalogClient, CatalogError, CatalogImage, CatalogProduct};

/// In-memory provider counting calls and failing on demand.
#[derive(Default)]
pub struct MockProvider {
    pub upload_calls: AtomicUsize,
    pub delete_image_calls: AtomicUsize,
    pub delete_snapshot_calls: AtomicUsize,
    /// Number of uploads that fail transiently before succeeding.
    pub transient_failures: AtomicUsize,
    /// Uploads to these regions fail terminally.
    pub terminal_regions: Mutex<HashSet<String>>,
    /// Image ids reported absent on the provider.
    pub missing_images: Mutex<HashSet<String>>,
    /// Snapshot ids backing any deleted image.
    pub snapshot_ids: Mutex<Vec<String>>,
    /// Launch permission groups seen per upload call.
    pub groups_seen: Mutex<Vec<Vec<String>>>,
}

impl MockProvider {
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_terminal_region(self, region: &str) -> Self {
        self.terminal_regions
            .lock()
            .unwrap()
            .insert(region.to_string());
        self
    }

    pub fn with_missing_image(self, image_id: &str) -> Self {
        self.missing_images
            .lock()
            .unwrap()
            .insert(image_id.to_string());
        self
    }

    pub fn with_snapshot_ids(self, ids: &[&str]) -> Self {
        *self.snapshot_ids.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[async_trait]
impl ImageProvider for MockProvider {
    async fn create_or_reuse_image(
        &self,
        descriptor: &ImageDescriptor,
        region: &str,
        account: &AwsAccount,
    ) -> Result<UploadedImage, ProviderError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.groups_seen
            .lock()
            .unwrap()
            .push(descriptor.groups.clone());
        if self.terminal_regions.lock().unwrap().contains(region) {
            return Err(ProviderError::Terminal("permission denied".to_string()));
        }
        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ProviderError::Transient("rate limit exceeded".to_string()));
        }
        Ok(UploadedImage {
            id: format!("ami-{}-{}", region, account.access_id.to_lowercase()),
            name: descriptor.image_name.clone(),
        })
    }

    async fn delete_image(
        &self,
        _region: &str,
        _account: &AwsAccount,
        image_id: &str,
        _image_name: &str,
    ) -> Result<DeletedImage, ProviderError> {
        self.delete_image_calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_images.lock().unwrap().contains(image_id) {
            return Ok(DeletedImage::default());
        }
        Ok(DeletedImage {
            image_id: Some(image_id.to_string()),
            snapshot_ids: self.snapshot_ids.lock().unwrap().clone(),
        })
    }

    async fn delete_snapshot(
        &self,
        _region: &str,
        _account: &AwsAccount,
        snapshot_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        self.delete_snapshot_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(snapshot_id.to_string()))
    }
}

/// In-memory catalog counting calls and failing on demand.
#[derive(Default)]
pub struct MockCatalog {
    pub products: Vec<CatalogProduct>,
    pub known_ids: HashSet<String>,
    pub update_not_found: bool,
    pub create_error: bool,
    pub visibility_error: bool,
    pub region_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub visibility_calls: AtomicUsize,
}

impl MockCatalog {
    pub fn with_hourly_products(names: &[&str]) -> Self {
        Self {
            products: names
                .iter()
                .map(|name| CatalogProduct {
                    name: format!("{}_HOURLY", name),
                    provider_short_name: "AWS".to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_known_id(mut self, image_id: &str) -> Self {
        self.known_ids.insert(image_id.to_string());
        self
    }
}

#[async_trait]
impl CatalogClient for MockCatalog {
    async fn list_products(&self) -> Result<Vec<CatalogProduct>, CatalogError> {
        Ok(self.products.clone())
    }

    async fn ensure_region(&self, _: &str, _: &str) -> Result<(), CatalogError> {
        self.region_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_image(&self, _: &CatalogImage) -> Result<(), CatalogError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.update_not_found {
            return Err(CatalogError::NotFound("record absent".to_string()));
        }
        Ok(())
    }

    async fn create_image(&self, _: &CatalogImage) -> Result<(), CatalogError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.create_error {
            return Err(CatalogError::Response {
                status: 500,
                body: "internal server error".to_string(),
            });
        }
        Ok(())
    }

    async fn set_visibility(&self, _: &CatalogImage, _: bool) -> Result<(), CatalogError> {
        self.visibility_calls.fetch_add(1, Ordering::SeqCst);
        if self.visibility_error {
            return Err(CatalogError::Response {
                status: 500,
                body: "internal server error".to_string(),
            });
        }
        Ok(())
    }

    async fn list_image_ids(&self) -> Result<HashSet<String>, CatalogError> {
        Ok(self.known_ids.clone())
    }
}

pub fn push_item(name: &str, regions: &[&str]) -> AmiPushItem {
    AmiPushItem {
        name: name.to_string(),
        src: format!("/staged/{}", name),
        regions: regions.iter().map(|r| r.to_string()).collect(),
        description: "Provided by Red Hat, Inc.".to_string(),
        image_type: ImageType::Hourly,
        release: Release {
            product: "RHEL".to_string(),
            base_product: None,
            base_version: None,
            version: Some("8.4".to_string()),
            variant: Some("Server".to_string()),
            arch: "x86_64".to_string(),
            respin: 1,
            date: NaiveDate::from_ymd_opt(2021, 8, 25).unwrap(),
            release_type: Some("ga".to_string()),
        },
        virtualization: "hvm".to_string(),
        root_device: "/dev/sda1".to_string(),
        volume: "gp2".to_string(),
        billing_codes: BillingCodes {
            name: "Hourly2".to_string(),
            codes: vec!["bp-6fa54006".to_string()],
        },
        boot_mode: None,
        sriov_net_support: Some("simple".to_string()),
        ena_support: Some(true),
        public_image: None,
        image_id: None,
        snapshot_id: None,
    }
}

pub fn delete_item(name: &str, region: &str, image_id: &str) -> AmiPushItem {
    let mut item = push_item(name, &[region]);
    item.image_id = Some(image_id.to_string());
    item
}

pub fn default_accounts() -> AccountsMap {
    AccountsMap::parse(r#"{"default": {"AKIADEFAULT": "secret"}}"#).unwrap()
}

pub fn push_config() -> PushConfig {
    PushConfig {
        provider_name: "AWS".to_string(),
        container_prefix: "redhat-cloudimg".to_string(),
        ship: false,
        allow_public_images: false,
        retry: RetryPolicy::new(4, 1),
        request_threads: 4,
    }
}

pub fn delete_config() -> DeleteConfig {
    DeleteConfig {
        provider_name: "AWS".to_string(),
        dry_run: false,
        keep_snapshot: false,
        limit: None,
        retry: RetryPolicy::new(4, 1),
        request_threads: 4,
    }
}

pub fn no_snapshot_accounts() -> SnapshotAccounts {
    SnapshotAccounts::default()
}
