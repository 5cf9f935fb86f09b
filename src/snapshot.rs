use crate::{
    clients::kubernetes::{poll_until, retry_error, ClientHelpers},
    error::{Error, Result},
};
use k8s_openapi::{
    api::core::v1::PersistentVolumeClaim, apimachinery::pkg::apis::meta::v1::Time,
    ClusterResourceScope,
};
use kube::{
    core::{ObjectMeta, TypeMeta},
    Api, Client, CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tracing::{info, warn};

pub const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    namespaced,
    status = "VolumeSnapshotStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    pub source: VolumeSnapshotSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_content_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeSnapshotError>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct VolumeSnapshotError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Time>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Retain,
}

/// `VolumeSnapshotClass` keeps its fields at the top level rather than
/// under `spec`, so it is modelled by hand instead of derived.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotClass {
    #[serde(flatten)]
    pub types: TypeMeta,

    pub metadata: ObjectMeta,

    pub driver: String,

    pub deletion_policy: DeletionPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
}

impl VolumeSnapshotClass {
    pub fn new(metadata: ObjectMeta, driver: &str) -> Self {
        Self {
            types: TypeMeta {
                api_version: <Self as k8s_openapi::Resource>::API_VERSION.to_owned(),
                kind: <Self as k8s_openapi::Resource>::KIND.to_owned(),
            },
            metadata,
            driver: driver.to_owned(),
            deletion_policy: DeletionPolicy::Delete,
            parameters: None,
        }
    }
}

impl k8s_openapi::Resource for VolumeSnapshotClass {
    const API_VERSION: &'static str = "snapshot.storage.k8s.io/v1";
    const GROUP: &'static str = SNAPSHOT_API_GROUP;
    const KIND: &'static str = "VolumeSnapshotClass";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "volumesnapshotclasses";
    type Scope = ClusterResourceScope;
}

impl k8s_openapi::Metadata for VolumeSnapshotClass {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub trait VolumeSnapshotExt {
    fn is_ready_to_use(&self) -> bool;
    fn error_message(&self) -> Option<String>;
}

impl VolumeSnapshotExt for VolumeSnapshot {
    fn is_ready_to_use(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.ready_to_use)
            .unwrap_or(false)
    }

    fn error_message(&self) -> Option<String> {
        self.status
            .as_ref()
            .and_then(|status| status.error.as_ref())
            .and_then(|error| error.message.clone())
    }
}

/// Builds a snapshot of `claim` taken with `class`.
pub fn volume_snapshot_for(
    namespace: &str,
    class: &VolumeSnapshotClass,
    claim: &PersistentVolumeClaim,
) -> Result<VolumeSnapshot> {
    let class_name = class
        .metadata
        .name
        .clone()
        .ok_or(Error::NotCreated("volume snapshot class"))?;
    let claim_name = claim
        .metadata
        .name
        .clone()
        .ok_or(Error::NotCreated("persistent volume claim"))?;

    let mut snapshot = VolumeSnapshot::new(
        "",
        VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(claim_name),
                ..Default::default()
            },
            volume_snapshot_class_name: Some(class_name),
        },
    );
    snapshot.metadata = ObjectMeta {
        generate_name: Some("volume-snapshot-".to_owned()),
        namespace: Some(namespace.to_owned()),
        ..Default::default()
    };

    Ok(snapshot)
}

/// A snapshot class owned by the test, plus the snapshots taken with it.
#[derive(Clone)]
pub struct TestVolumeSnapshotClass {
    client: Client,
    namespace: String,
    volume_snapshot_class: VolumeSnapshotClass,
}

impl TestVolumeSnapshotClass {
    pub fn new(client: Client, namespace: &str, volume_snapshot_class: VolumeSnapshotClass) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
            volume_snapshot_class,
        }
    }

    pub fn volume_snapshot_class(&self) -> &VolumeSnapshotClass {
        &self.volume_snapshot_class
    }

    pub fn set_parameter(&mut self, key: &str, value: &str) {
        self.volume_snapshot_class
            .parameters
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_owned(), value.to_owned());
    }

    fn snapshots(&self) -> Api<VolumeSnapshot> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub async fn create(&mut self) -> Result<()> {
        info!(driver = %self.volume_snapshot_class.driver, "creating volume snapshot class");

        self.volume_snapshot_class = self
            .client
            .create_cluster_resource(&self.volume_snapshot_class)
            .await?;

        info!(name = %self.volume_snapshot_class.name_any(), "created volume snapshot class");
        Ok(())
    }

    pub async fn create_snapshot(&self, claim: &PersistentVolumeClaim) -> Result<VolumeSnapshot> {
        let snapshot = volume_snapshot_for(&self.namespace, &self.volume_snapshot_class, claim)?;
        let snapshot = self
            .client
            .create_namespaced_resource(&self.namespace, &snapshot)
            .await?;

        info!(name = %snapshot.name_any(), claim = %claim.name_any(), "created volume snapshot");
        Ok(snapshot)
    }

    /// Waits until the snapshot controller marks the snapshot ready.  Errors
    /// reported in the status are retried, since the controller clears them
    /// once the cloud operation recovers.
    pub async fn ready_to_use(&self, snapshot: &VolumeSnapshot, timeout: Duration) -> Result<()> {
        let api = self.snapshots();
        let name = snapshot.name_any();

        info!(name = %name, "waiting for volume snapshot to be ready to use");
        poll_until(timeout, || async {
            let current = api
                .get(&name)
                .await
                .map_err(retry_error::<Error>)?;

            if current.is_ready_to_use() {
                return Ok(());
            }

            let message = current.error_message();
            if let Some(ref message) = message {
                warn!(name = %name, message = %message, "volume snapshot reports an error");
            }

            Err(backoff::Error::transient(Error::SnapshotNotReady {
                name: name.clone(),
                message,
            }))
        })
        .await?;

        info!(name = %name, "volume snapshot is ready to use");
        Ok(())
    }

    pub async fn delete_snapshot(&self, snapshot: &VolumeSnapshot, timeout: Duration) -> Result<()> {
        let api = self.snapshots();
        let name = snapshot.name_any();

        info!(name = %name, "deleting volume snapshot");
        self.client.delete_resource(&api, &name).await?;
        self.client.wait_for_deletion(&api, &name, timeout).await?;

        Ok(())
    }

    pub async fn cleanup(&self) -> Result<()> {
        let name = self
            .volume_snapshot_class
            .metadata
            .name
            .clone()
            .ok_or(Error::NotCreated("volume snapshot class"))?;
        let api: Api<VolumeSnapshotClass> = Api::all(self.client.clone());

        info!(name = %name, "deleting volume snapshot class");
        self.client.delete_resource(&api, &name).await?;

        Ok(())
    }
}
