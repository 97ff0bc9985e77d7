use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::item::{AmiPushItem, ImageType};
use crate::provider::UploadedImage;
use crate::rhsm::{CatalogClient, CatalogError, CatalogImage, CatalogProduct};

#[derive(Error, Debug)]
pub enum Error {
    #[error("product not in catalog: {0}")]
    MissingProduct(String),

    #[error("pre-push verification of push items in metadata service failed")]
    VerificationFailed,

    #[error("region registration failed for {region}: {source}")]
    Region {
        region: String,
        source: CatalogError,
    },

    #[error("update failed for {image_id}: {source}")]
    Update {
        image_id: String,
        source: CatalogError,
    },

    #[error("create failed for {image_id} after absent record ({update}): {create}")]
    CreateAfterNotFound {
        image_id: String,
        update: CatalogError,
        create: CatalogError,
    },

    #[error(transparent)]
    Client(#[from] CatalogError),
}

/// How a successful catalog synchronization came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Updated,
    CreatedAfterNotFound,
}

/// Makes the catalog consistent with uploaded images. The product list is
/// fetched once at construction; a missing product is a configuration error
/// surfaced before any item work starts.
pub struct CatalogSync {
    client: Arc<dyn CatalogClient>,
    provider_name: String,
    products: Vec<CatalogProduct>,
}

impl CatalogSync {
    pub async fn new(client: Arc<dyn CatalogClient>, provider_name: &str) -> Result<Self, Error> {
        let products = client.list_products().await?;
        let mut names: Vec<String> = products
            .iter()
            .map(|p| format!("{}({})", p.name, p.provider_short_name))
            .collect();
        names.sort();
        debug!(
            "{} products ({} provider) in the catalog: {}",
            names.len(),
            provider_name,
            names.join(", ")
        );
        Ok(Self {
            client,
            provider_name: provider_name.to_string(),
            products,
        })
    }

    /// Product entry for the given product and image type. The catalog name
    /// is the product short name plus "_HOURLY" for hourly type images.
    pub fn product_for(
        &self,
        product: &str,
        image_type: ImageType,
    ) -> Result<&CatalogProduct, Error> {
        let name = match image_type {
            ImageType::Hourly => format!("{}_HOURLY", product),
            _ => product.to_string(),
        };
        debug!(
            "Searching for product {} for provider {} in the catalog",
            name, self.provider_name
        );
        self.products
            .iter()
            .find(|p| p.name == name && p.provider_short_name == self.provider_name)
            .ok_or(Error::MissingProduct(name))
    }

    /// Checks that every push item's product is known to the catalog.
    /// Publishing targets must be pre-registered, so a miss fails the whole
    /// run before any upload starts.
    pub fn verify_items(&self, items: &[AmiPushItem]) -> Result<(), Error> {
        let mut verified = true;
        for item in items {
            if let Err(err) = self.product_for(&item.release.product, item.image_type) {
                error!(
                    "Pre-push check in metadata service failed for {} at {}: {}",
                    item.name, item.src, err
                );
                verified = false;
            }
        }
        if verified {
            Ok(())
        } else {
            Err(Error::VerificationFailed)
        }
    }

    fn catalog_image(
        &self,
        item: &AmiPushItem,
        image_id: &str,
        image_name: &str,
        region: Option<&str>,
    ) -> Result<CatalogImage, Error> {
        let product = self.product_for(&item.release.product, item.image_type)?;
        Ok(CatalogImage {
            image_id: image_id.to_string(),
            image_name: image_name.to_string(),
            arch: item.release.arch.clone(),
            product_name: product.name.clone(),
            version: item.release.version.clone(),
            variant: item.release.variant.clone(),
            region: region.map(str::to_string),
        })
    }

    /// Registers an uploaded image with the catalog. The region is created
    /// first, then the existing record is updated; only an absent record
    /// falls through to a create attempt.
    pub async fn sync_image(
        &self,
        item: &AmiPushItem,
        region: &str,
        image: &UploadedImage,
    ) -> Result<SyncOutcome, Error> {
        info!("Creating region {} [{}]", region, self.provider_name);
        self.client
            .ensure_region(region, &self.provider_name)
            .await
            .map_err(|source| Error::Region {
                region: region.to_string(),
                source,
            })?;

        let meta = self.catalog_image(item, &image.id, &image.name, Some(region))?;

        info!("Attempting to update the existing image {} in the catalog", image.id);
        match self.client.update_image(&meta).await {
            Ok(()) => {
                info!("Successfully registered image {} with the catalog", image.id);
                Ok(SyncOutcome::Updated)
            }
            Err(update) if update.is_not_found() => {
                warn!(
                    "Update failed for {}. Image might not be present in the catalog.",
                    image.id
                );
                info!("Attempting to create new image {} in the catalog", image.id);
                match self.client.create_image(&meta).await {
                    Ok(()) => {
                        info!(
                            "Successfully registered image {} with the catalog",
                            image.id
                        );
                        Ok(SyncOutcome::CreatedAfterNotFound)
                    }
                    Err(create) => Err(Error::CreateAfterNotFound {
                        image_id: image.id.clone(),
                        update,
                        create,
                    }),
                }
            }
            Err(source) => Err(Error::Update {
                image_id: image.id.clone(),
                source,
            }),
        }
    }

    /// Soft-deletes the record so user-facing discovery stops before the
    /// image itself is removed from the provider.
    pub async fn mark_invisible(&self, item: &AmiPushItem, image_id: &str) -> Result<(), Error> {
        let meta = self.catalog_image(item, image_id, &item.name, None)?;
        self.client
            .set_visibility(&meta, false)
            .await
            .map_err(|source| Error::Update {
                image_id: image_id.to_string(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::item::{BillingCodes, Release};

    #[derive(Default)]
    struct StubCatalog {
        products: Vec<CatalogProduct>,
        update_not_found: bool,
        update_error: bool,
        create_error: bool,
        update_calls: AtomicUsize,
        create_calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogClient for StubCatalog {
        async fn list_products(&self) -> Result<Vec<CatalogProduct>, CatalogError> {
            Ok(self.products.clone())
        }

        async fn ensure_region(&self, _: &str, _: &str) -> Result<(), CatalogError> {
            Ok(())
        }

        async fn update_image(&self, _: &CatalogImage) -> Result<(), CatalogError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            if self.update_not_found {
                return Err(CatalogError::NotFound("no such ami".into()));
            }
            if self.update_error {
                return Err(CatalogError::Response {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(())
        }

        async fn create_image(&self, _: &CatalogImage) -> Result<(), CatalogError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.create_error {
                return Err(CatalogError::Response {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(())
        }

        async fn set_visibility(&self, _: &CatalogImage, _: bool) -> Result<(), CatalogError> {
            Ok(())
        }

        async fn list_image_ids(&self) -> Result<HashSet<String>, CatalogError> {
            Ok(HashSet::new())
        }
    }

    fn hourly_product() -> Vec<CatalogProduct> {
        vec![CatalogProduct {
            name: "RHEL_HOURLY".to_string(),
            provider_short_name: "AWS".to_string(),
        }]
    }

    fn item() -> AmiPushItem {
        AmiPushItem {
            name: "rhel.raw".to_string(),
            src: "/staged/rhel.raw".to_string(),
            regions: vec!["us-east-1".to_string()],
            description: String::new(),
            image_type: ImageType::Hourly,
            release: Release {
                product: "RHEL".to_string(),
                base_product: None,
                base_version: None,
                version: Some("8.4".to_string()),
                variant: None,
                arch: "x86_64".to_string(),
                respin: 0,
                date: NaiveDate::from_ymd_opt(2021, 8, 25).unwrap(),
                release_type: None,
            },
            virtualization: "hvm".to_string(),
            root_device: "/dev/sda1".to_string(),
            volume: "gp2".to_string(),
            billing_codes: BillingCodes {
                name: "Hourly2".to_string(),
                codes: vec![],
            },
            boot_mode: None,
            sriov_net_support: None,
            ena_support: None,
            public_image: None,
            image_id: None,
            snapshot_id: None,
        }
    }

    fn image() -> UploadedImage {
        UploadedImage {
            id: "ami-0123456789".to_string(),
            name: "RHEL-8.4".to_string(),
        }
    }

    async fn sync_with(stub: StubCatalog) -> (Arc<StubCatalog>, CatalogSync) {
        let stub = Arc::new(StubCatalog {
            products: hourly_product(),
            ..stub
        });
        let sync = CatalogSync::new(stub.clone(), "AWS").await.unwrap();
        (stub, sync)
    }

    #[tokio::test]
    async fn update_success_yields_updated() {
        let (stub, sync) = sync_with(StubCatalog::default()).await;
        let outcome = sync.sync_image(&item(), "us-east-1", &image()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Updated);
        assert_eq!(stub.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn absent_record_falls_through_to_create() {
        let (stub, sync) = sync_with(StubCatalog {
            update_not_found: true,
            ..Default::default()
        })
        .await;
        let outcome = sync.sync_image(&item(), "us-east-1", &image()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::CreatedAfterNotFound);
        assert_eq!(stub.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_absent_update_failure_never_creates() {
        let (stub, sync) = sync_with(StubCatalog {
            update_error: true,
            ..Default::default()
        })
        .await;
        let err = sync
            .sync_image(&item(), "us-east-1", &image())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Update { .. }));
        assert_eq!(stub.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn create_failure_surfaces_both_errors() {
        let (_, sync) = sync_with(StubCatalog {
            update_not_found: true,
            create_error: true,
            ..Default::default()
        })
        .await;
        let err = sync
            .sync_image(&item(), "us-east-1", &image())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no such ami"));
        assert!(msg.contains("boom"));
    }

    #[tokio::test]
    async fn hourly_products_use_the_hourly_suffix() {
        let (_, sync) = sync_with(StubCatalog::default()).await;
        assert!(sync.product_for("RHEL", ImageType::Hourly).is_ok());
        assert!(matches!(
            sync.product_for("RHEL", ImageType::Access),
            Err(Error::MissingProduct(name)) if name == "RHEL"
        ));
    }

    #[tokio::test]
    async fn verification_fails_on_missing_product() {
        let (_, sync) = sync_with(StubCatalog::default()).await;
        let mut other = item();
        other.release.product = "FEDORA".to_string();
        assert!(sync.verify_items(&[item()]).is_ok());
        assert!(matches!(
            sync.verify_items(&[item(), other]),
            Err(Error::VerificationFailed)
        ));
    }
}
