use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PRODUCTS_PATH: &str = "/v1/internal/cloud_access_providers/amazon/provider_image_groups";
const REGIONS_PATH: &str = "/v1/internal/cloud_access_providers/amazon/regions";
const AMIS_PATH: &str = "/v1/internal/cloud_access_providers/amazon/amis";

const LIST_PAGE_SIZE: usize = 1000;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog record not found: {0}")]
    NotFound(String),

    #[error("catalog request failed, code: {status}, body: {body}")]
    Response { status: u16, body: String },

    #[error("unexpected catalog response, code: {0}, body: {1}")]
    Decode(u16, String),

    #[error("catalog transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("read catalog client certificate: {0}")]
    Identity(std::io::Error),
}

impl CatalogError {
    /// Whether the failure means the addressed record is absent, as opposed
    /// to the request itself failing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound(_))
    }
}

/// A product entry in the catalog, keyed by name and provider short name.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogProduct {
    pub name: String,
    #[serde(rename = "providerShortName")]
    pub provider_short_name: String,
}

/// Image metadata as the catalog tracks it.
#[derive(Debug, Clone)]
pub struct CatalogImage {
    pub image_id: String,
    pub image_name: String,
    pub arch: String,
    pub product_name: String,
    pub version: Option<String>,
    pub variant: Option<String>,
    /// Region the image lives in; required when creating a new record.
    pub region: Option<String>,
}

/// Product-catalog collaborator surface consumed by the synchronizer.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn list_products(&self) -> Result<Vec<CatalogProduct>, CatalogError>;

    /// Registers the region with the catalog; returns Ok when it is already
    /// present.
    async fn ensure_region(&self, region: &str, provider_name: &str) -> Result<(), CatalogError>;

    /// Updates an existing image record, leaving it visible.
    async fn update_image(&self, image: &CatalogImage) -> Result<(), CatalogError>;

    async fn create_image(&self, image: &CatalogImage) -> Result<(), CatalogError>;

    /// Flips the visibility flag on an existing record without deleting it.
    async fn set_visibility(
        &self,
        image: &CatalogImage,
        visible: bool,
    ) -> Result<(), CatalogError>;

    async fn list_image_ids(&self) -> Result<HashSet<String>, CatalogError>;
}

/// Client for RHSM updates.
pub struct RhsmClient {
    url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct RegionPayload<'a> {
    #[serde(rename = "regionID")]
    region_id: &'a str,
    #[serde(rename = "providerShortname")]
    provider_shortname: &'a str,
}

#[derive(Serialize)]
struct AmiPayload<'a> {
    #[serde(rename = "amiID")]
    ami_id: &'a str,
    arch: String,
    product: &'a str,
    version: &'a str,
    variant: &'a str,
    description: String,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<&'a str>,
}

impl<'a> AmiPayload<'a> {
    fn new(image: &'a CatalogImage, status: &'a str, with_region: bool) -> Self {
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S");
        Self {
            ami_id: &image.image_id,
            arch: image.arch.to_lowercase(),
            product: &image.product_name,
            version: image.version.as_deref().unwrap_or("none"),
            variant: image.variant.as_deref().unwrap_or("none"),
            description: format!("Released {} on {}", image.image_name, now),
            status,
            region: if with_region {
                image.region.as_deref()
            } else {
                None
            },
        }
    }
}

#[derive(Deserialize)]
struct ProductsResponse {
    body: Vec<CatalogProduct>,
}

#[derive(Deserialize)]
struct AmiPage {
    pagination: Pagination,
    #[serde(default)]
    body: Vec<AmiRecord>,
}

#[derive(Deserialize)]
struct Pagination {
    count: usize,
}

#[derive(Deserialize)]
struct AmiRecord {
    #[serde(rename = "amiID")]
    ami_id: String,
}

impl RhsmClient {
    /// Creates a new RHSM client. The optional PEM bundle carries the client
    /// certificate and key for cert-authenticated catalogs.
    pub fn new(url: String, identity_pem: Option<&Path>) -> Result<Self, CatalogError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(60));
        if let Some(path) = identity_pem {
            let pem = std::fs::read(path).map_err(CatalogError::Identity)?;
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }
        Ok(Self {
            url,
            client: builder.build()?,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CatalogError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(CatalogError::NotFound(body))
        } else {
            Err(CatalogError::Response {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl CatalogClient for RhsmClient {
    async fn list_products(&self) -> Result<Vec<CatalogProduct>, CatalogError> {
        let url = self.endpoint(PRODUCTS_PATH);
        debug!("Fetching products from {}", url);

        let resp = Self::check(self.client.get(&url).send().await?).await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;

        match serde_json::from_slice::<ProductsResponse>(&bytes) {
            Ok(products) => Ok(products.body),
            Err(_) => {
                let body = String::from_utf8_lossy(&bytes);
                Err(CatalogError::Decode(status, body.to_string()))
            }
        }
    }

    async fn ensure_region(&self, region: &str, provider_name: &str) -> Result<(), CatalogError> {
        let payload = RegionPayload {
            region_id: region,
            provider_shortname: provider_name,
        };
        let resp = self
            .client
            .post(self.endpoint(REGIONS_PATH))
            .json(&payload)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    async fn update_image(&self, image: &CatalogImage) -> Result<(), CatalogError> {
        let payload = AmiPayload::new(image, "VISIBLE", false);
        let resp = self
            .client
            .put(self.endpoint(AMIS_PATH))
            .json(&payload)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    async fn create_image(&self, image: &CatalogImage) -> Result<(), CatalogError> {
        let payload = AmiPayload::new(image, "VISIBLE", true);
        let resp = self
            .client
            .post(self.endpoint(AMIS_PATH))
            .json(&payload)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    async fn set_visibility(
        &self,
        image: &CatalogImage,
        visible: bool,
    ) -> Result<(), CatalogError> {
        let status = if visible { "VISIBLE" } else { "INVISIBLE" };
        let payload = AmiPayload::new(image, status, false);
        let resp = self
            .client
            .put(self.endpoint(AMIS_PATH))
            .json(&payload)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    async fn list_image_ids(&self) -> Result<HashSet<String>, CatalogError> {
        let url = self.endpoint(AMIS_PATH);
        debug!("Listing all images from the catalog, {}", url);

        let mut image_ids = HashSet::new();
        let mut offset = 0usize;
        loop {
            let resp = self
                .client
                .get(&url)
                .query(&[("limit", LIST_PAGE_SIZE), ("offset", offset)])
                .send()
                .await?;
            let resp = Self::check(resp).await?;
            let status = resp.status().as_u16();
            let bytes = resp.bytes().await?;
            let page = match serde_json::from_slice::<AmiPage>(&bytes) {
                Ok(page) => page,
                Err(_) => {
                    let body = String::from_utf8_lossy(&bytes);
                    return Err(CatalogError::Decode(status, body.to_string()));
                }
            };
            if page.pagination.count == 0 {
                break;
            }
            offset += page.pagination.count;
            for record in page.body {
                image_ids.insert(record.ami_id);
            }
        }
        Ok(image_ids)
    }
}
