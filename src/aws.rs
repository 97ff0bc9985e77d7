use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::config::Credentials;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    ArchitectureValues, BlockDeviceMapping, BootModeValues, CreateVolumePermission,
    CreateVolumePermissionModifications, EbsBlockDevice, Filter, LaunchPermission,
    LaunchPermissionModifications, PermissionGroup, SnapshotAttributeName, SnapshotDiskContainer,
    Tag, UserBucket, VolumeType,
};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::config::AwsAccount;
use crate::provider::{
    DeletedImage, ImageDescriptor, ImageProvider, ProviderError, UploadedImage,
};

const CREDENTIALS_PROVIDER_NAME: &str = "amipub";

const IMPORT_POLL_INTERVAL: Duration = Duration::from_secs(15);
const IMPORT_POLL_ATTEMPTS: u32 = 240;

/// Service error codes worth another attempt.
const TRANSIENT_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
    "RequestThrottled",
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "Unavailable",
    "SlowDown",
];

fn classify<E>(action: &str, err: SdkError<E>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => err
            .code()
            .map(|code| TRANSIENT_CODES.contains(&code))
            .unwrap_or(false),
        _ => false,
    };
    let detail = match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{}: {}: {}", action, code, message),
        (Some(code), None) => format!("{}: {}", action, code),
        _ => format!("{}: {}", action, err),
    };
    if transient {
        ProviderError::Transient(detail)
    } else {
        ProviderError::Terminal(detail)
    }
}

fn error_code<E>(err: &SdkError<E>) -> Option<&str>
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::ServiceError(inner) => inner.err().code(),
        _ => None,
    }
}

#[derive(Clone)]
struct Clients {
    ec2: aws_sdk_ec2::Client,
    s3: aws_sdk_s3::Client,
}

/// AWS implementation of the image provider. Publishing is the classic
/// import workflow: stage the image bits in S3, import them as an EBS
/// snapshot, register the snapshot as an AMI, then adjust permissions.
/// Every step is keyed by the derived image/snapshot name so a repeated
/// call finds the existing resource instead of creating a duplicate.
pub struct AwsProvider {
    clients: Mutex<HashMap<String, Clients>>,
}

impl AwsProvider {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn clients(&self, region: &str, account: &AwsAccount) -> Clients {
        let key = format!("{}/{}", region, account.access_id);
        let mut cache = self.clients.lock().await;
        if let Some(clients) = cache.get(&key) {
            return clients.clone();
        }
        let credentials = Credentials::new(
            account.access_id.clone(),
            account.secret_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER_NAME,
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .load()
            .await;
        let clients = Clients {
            ec2: aws_sdk_ec2::Client::new(&config),
            s3: aws_sdk_s3::Client::new(&config),
        };
        cache.insert(key, clients.clone());
        clients
    }

    async fn find_image_by_name(
        &self,
        ec2: &aws_sdk_ec2::Client,
        name: &str,
    ) -> Result<Option<String>, ProviderError> {
        let resp = ec2
            .describe_images()
            .owners("self")
            .filters(Filter::builder().name("name").values(name).build())
            .send()
            .await
            .map_err(|err| classify("describe images", err))?;
        Ok(resp
            .images()
            .first()
            .and_then(|image| image.image_id())
            .map(str::to_string))
    }

    async fn find_snapshot_by_name(
        &self,
        ec2: &aws_sdk_ec2::Client,
        name: &str,
    ) -> Result<Option<String>, ProviderError> {
        let resp = ec2
            .describe_snapshots()
            .owner_ids("self")
            .filters(Filter::builder().name("tag:Name").values(name).build())
            .send()
            .await
            .map_err(|err| classify("describe snapshots", err))?;
        Ok(resp
            .snapshots()
            .first()
            .and_then(|snapshot| snapshot.snapshot_id())
            .map(str::to_string))
    }

    /// Stages the image bits in the container bucket, creating the bucket on
    /// first use. An object already present under the same key is reused.
    async fn stage_object(
        &self,
        s3: &aws_sdk_s3::Client,
        descriptor: &ImageDescriptor,
        region: &str,
    ) -> Result<String, ProviderError> {
        let bucket = &descriptor.container;
        let key = descriptor
            .image_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| descriptor.snapshot_name.clone());

        let mut create = s3.create_bucket().bucket(bucket);
        // us-east-1 rejects an explicit location constraint
        if region != "us-east-1" {
            create = create.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        if let Err(err) = create.send().await {
            if error_code(&err) != Some("BucketAlreadyOwnedByYou") {
                return Err(classify("create container", err));
            }
        }

        if s3.head_object().bucket(bucket).key(&key).send().await.is_ok() {
            debug!("Object {}/{} already staged, skipping upload", bucket, key);
            return Ok(key);
        }

        info!(
            "Uploading {} to container {}",
            descriptor.image_path.display(),
            bucket
        );
        let body = ByteStream::from_path(&descriptor.image_path)
            .await
            .map_err(|err| {
                ProviderError::Terminal(format!(
                    "read {}: {}",
                    descriptor.image_path.display(),
                    err
                ))
            })?;
        s3.put_object()
            .bucket(bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|err| classify("upload image", err))?;
        Ok(key)
    }

    /// Imports the staged object as an EBS snapshot and waits for the import
    /// task to settle. The snapshot is tagged with its name so a retried
    /// push finds it instead of importing again.
    async fn import_snapshot(
        &self,
        ec2: &aws_sdk_ec2::Client,
        descriptor: &ImageDescriptor,
        key: &str,
    ) -> Result<String, ProviderError> {
        if let Some(existing) = self
            .find_snapshot_by_name(ec2, &descriptor.snapshot_name)
            .await?
        {
            debug!(
                "Snapshot {} already present as {}",
                descriptor.snapshot_name, existing
            );
            return Ok(existing);
        }

        let task = ec2
            .import_snapshot()
            .description(&descriptor.snapshot_name)
            .disk_container(
                SnapshotDiskContainer::builder()
                    .format("RAW")
                    .user_bucket(
                        UserBucket::builder()
                            .s3_bucket(&descriptor.container)
                            .s3_key(key)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|err| classify("import snapshot", err))?;
        let task_id = task
            .import_task_id()
            .ok_or_else(|| ProviderError::Terminal("import task id missing".to_string()))?
            .to_string();
        info!("Waiting for snapshot import task {}", task_id);

        let mut attempts = IMPORT_POLL_ATTEMPTS;
        let snapshot_id = loop {
            let resp = ec2
                .describe_import_snapshot_tasks()
                .import_task_ids(&task_id)
                .send()
                .await
                .map_err(|err| classify("describe import task", err))?;
            let detail = resp
                .import_snapshot_tasks()
                .first()
                .and_then(|task| task.snapshot_task_detail());
            match detail.and_then(|d| d.status()) {
                Some("completed") => {
                    break detail
                        .and_then(|d| d.snapshot_id())
                        .ok_or_else(|| {
                            ProviderError::Terminal(format!(
                                "import task {} completed without a snapshot id",
                                task_id
                            ))
                        })?
                        .to_string();
                }
                Some("error") | Some("deleted") | Some("deleting") => {
                    let message = detail
                        .and_then(|d| d.status_message())
                        .unwrap_or("no detail");
                    return Err(ProviderError::Terminal(format!(
                        "import task {} failed: {}",
                        task_id, message
                    )));
                }
                _ => {
                    attempts -= 1;
                    if attempts == 0 {
                        return Err(ProviderError::Transient(format!(
                            "import task {} still not settled, giving up",
                            task_id
                        )));
                    }
                    tokio::time::sleep(IMPORT_POLL_INTERVAL).await;
                }
            }
        };

        ec2.create_tags()
            .resources(&snapshot_id)
            .tags(
                Tag::builder()
                    .key("Name")
                    .value(&descriptor.snapshot_name)
                    .build(),
            )
            .send()
            .await
            .map_err(|err| classify("tag snapshot", err))?;
        Ok(snapshot_id)
    }

    async fn share_snapshot(
        &self,
        ec2: &aws_sdk_ec2::Client,
        snapshot_id: &str,
        account_ids: &[String],
    ) -> Result<(), ProviderError> {
        if account_ids.is_empty() {
            return Ok(());
        }
        let mut permissions = CreateVolumePermissionModifications::builder();
        for account_id in account_ids {
            permissions = permissions.add(
                CreateVolumePermission::builder()
                    .user_id(account_id)
                    .build(),
            );
        }
        ec2.modify_snapshot_attribute()
            .snapshot_id(snapshot_id)
            .attribute(SnapshotAttributeName::CreateVolumePermission)
            .create_volume_permission(permissions.build())
            .send()
            .await
            .map_err(|err| classify("share snapshot", err))?;
        Ok(())
    }

    async fn register_image(
        &self,
        ec2: &aws_sdk_ec2::Client,
        descriptor: &ImageDescriptor,
        snapshot_id: &str,
    ) -> Result<String, ProviderError> {
        let ebs = EbsBlockDevice::builder()
            .snapshot_id(snapshot_id)
            .volume_type(VolumeType::from(
                descriptor.volume_type.to_lowercase().as_str(),
            ))
            .delete_on_termination(true)
            .build();
        let mut request = ec2
            .register_image()
            .name(&descriptor.image_name)
            .description(&descriptor.description)
            .architecture(ArchitectureValues::from(descriptor.arch.as_str()))
            .virtualization_type(&descriptor.virt_type)
            .root_device_name(&descriptor.root_device_name)
            .ena_support(descriptor.ena_support)
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name(&descriptor.root_device_name)
                    .ebs(ebs)
                    .build(),
            );
        if let Some(sriov) = &descriptor.sriov_net_support {
            request = request.sriov_net_support(sriov);
        }
        if let Some(boot_mode) = descriptor.boot_mode {
            request = request.boot_mode(BootModeValues::from(boot_mode.aws_value()));
        }
        for code in &descriptor.billing_products {
            request = request.billing_products(code);
        }
        let resp = request
            .send()
            .await
            .map_err(|err| classify("register image", err))?;
        resp.image_id()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Terminal("register image returned no id".to_string()))
    }

    async fn apply_groups(
        &self,
        ec2: &aws_sdk_ec2::Client,
        image_id: &str,
        groups: &[String],
    ) -> Result<(), ProviderError> {
        if groups.is_empty() {
            return Ok(());
        }
        let mut permissions = LaunchPermissionModifications::builder();
        for group in groups {
            let group = match group.as_str() {
                "all" => PermissionGroup::All,
                other => PermissionGroup::from(other),
            };
            permissions = permissions.add(LaunchPermission::builder().group(group).build());
        }
        ec2.modify_image_attribute()
            .image_id(image_id)
            .launch_permission(permissions.build())
            .send()
            .await
            .map_err(|err| classify("modify image attribute", err))?;
        Ok(())
    }
}

impl Default for AwsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageProvider for AwsProvider {
    async fn create_or_reuse_image(
        &self,
        descriptor: &ImageDescriptor,
        region: &str,
        account: &AwsAccount,
    ) -> Result<UploadedImage, ProviderError> {
        let clients = self.clients(region, account).await;

        if let Some(existing) = self
            .find_image_by_name(&clients.ec2, &descriptor.image_name)
            .await?
        {
            info!(
                "Image {} already present in {} as {}",
                descriptor.image_name, region, existing
            );
            // A repeat call only updates the launch permission groups
            self.apply_groups(&clients.ec2, &existing, &descriptor.groups)
                .await?;
            return Ok(UploadedImage {
                id: existing,
                name: descriptor.image_name.clone(),
            });
        }

        let key = self.stage_object(&clients.s3, descriptor, region).await?;
        let snapshot_id = self.import_snapshot(&clients.ec2, descriptor, &key).await?;
        self.share_snapshot(&clients.ec2, &snapshot_id, &descriptor.snapshot_account_ids)
            .await?;
        let image_id = self
            .register_image(&clients.ec2, descriptor, &snapshot_id)
            .await?;
        self.apply_groups(&clients.ec2, &image_id, &descriptor.groups)
            .await?;
        Ok(UploadedImage {
            id: image_id,
            name: descriptor.image_name.clone(),
        })
    }

    async fn delete_image(
        &self,
        region: &str,
        account: &AwsAccount,
        image_id: &str,
        image_name: &str,
    ) -> Result<DeletedImage, ProviderError> {
        let clients = self.clients(region, account).await;

        let resp = clients.ec2.describe_images().image_ids(image_id).send().await;
        let image = match resp {
            Ok(described) => described.images().first().cloned(),
            Err(err) => {
                if error_code(&err)
                    .map(|code| code.starts_with("InvalidAMIID"))
                    .unwrap_or(false)
                {
                    None
                } else {
                    return Err(classify("describe image", err));
                }
            }
        };
        let Some(image) = image else {
            warn!("Image {} ({}) not found in {}", image_id, image_name, region);
            return Ok(DeletedImage::default());
        };

        let snapshot_ids = image
            .block_device_mappings()
            .iter()
            .filter_map(|mapping| mapping.ebs())
            .filter_map(|ebs| ebs.snapshot_id())
            .map(str::to_string)
            .collect();

        clients
            .ec2
            .deregister_image()
            .image_id(image_id)
            .send()
            .await
            .map_err(|err| classify("deregister image", err))?;
        Ok(DeletedImage {
            image_id: Some(image_id.to_string()),
            snapshot_ids,
        })
    }

    async fn delete_snapshot(
        &self,
        region: &str,
        account: &AwsAccount,
        snapshot_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        let clients = self.clients(region, account).await;
        match clients
            .ec2
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
        {
            Ok(_) => Ok(Some(snapshot_id.to_string())),
            Err(err) => {
                if error_code(&err)
                    .map(|code| code.starts_with("InvalidSnapshot"))
                    .unwrap_or(false)
                {
                    warn!("Snapshot {} not found in {}", snapshot_id, region);
                    Ok(None)
                } else {
                    Err(classify("delete snapshot", err))
                }
            }
        }
    }
}
