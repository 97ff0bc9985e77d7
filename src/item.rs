use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One staged machine image to publish or retract.
///
/// Immutable once loaded from a source; consumed once per resolved target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AmiPushItem {
    pub name: String,
    /// Source path or URL of the staged image file.
    pub src: String,
    /// Regions the image is published to.
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub image_type: ImageType,
    pub release: Release,
    pub virtualization: String,
    pub root_device: String,
    pub volume: String,
    pub billing_codes: BillingCodes,
    #[serde(default)]
    pub boot_mode: Option<BootMode>,
    #[serde(default)]
    pub sriov_net_support: Option<String>,
    #[serde(default)]
    pub ena_support: Option<bool>,
    #[serde(default)]
    pub public_image: Option<bool>,
    /// Provider image id, set on items targeted for deletion.
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Access,
    Hourly,
    Marketplace,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Access => "access",
            ImageType::Hourly => "hourly",
            ImageType::Marketplace => "marketplace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Legacy,
    Uefi,
    Hybrid,
}

impl BootMode {
    /// Boot mode value understood by the EC2 RegisterImage call.
    pub fn aws_value(&self) -> &'static str {
        match self {
            BootMode::Legacy => "legacy-bios",
            BootMode::Uefi => "uefi",
            BootMode::Hybrid => "uefi-preferred",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Release {
    pub product: String,
    #[serde(default)]
    pub base_product: Option<String>,
    #[serde(default)]
    pub base_version: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    pub arch: String,
    pub respin: u32,
    pub date: NaiveDate,
    #[serde(rename = "type", default)]
    pub release_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingCodes {
    pub name: String,
    pub codes: Vec<String>,
}

impl AmiPushItem {
    /// Constructs the image name from the metadata.
    pub fn image_name(&self) -> String {
        let release = &self.release;
        let mut parts = Vec::new();

        if let Some(base_product) = &release.base_product {
            parts.push(base_product.clone());
            if let Some(base_version) = &release.base_version {
                parts.push(base_version.clone());
            }
        }

        parts.push(release.product.clone());

        // Some attributes are separated by underscores
        let mut underscore_parts = Vec::new();
        if let Some(version) = &release.version {
            underscore_parts.push(version.clone());
        }
        underscore_parts.push(self.virtualization.to_uppercase());
        if let Some(release_type) = &release.release_type {
            underscore_parts.push(release_type.to_uppercase());
        }
        parts.push(underscore_parts.join("_"));

        parts.push(release.date.format("%Y%m%d").to_string());
        parts.push(release.arch.clone());
        parts.push(release.respin.to_string());
        parts.push(self.billing_codes.name.clone());
        parts.push(self.volume.to_uppercase());

        parts.join("-")
    }

    /// Whether the image should be released publicly once shipped. Items
    /// without an explicit flag default to public for hourly images only,
    /// since those are the only type charging an additional fee.
    pub fn effective_public_image(&self) -> bool {
        self.public_image
            .unwrap_or(self.image_type == ImageType::Hourly)
    }
}
