use crate::{
    cleanup::CleanupStack,
    clients::kubernetes::{poll_until, retry_error, ClientHelpers},
    config::{DataSource, ReclaimPolicy, Timeouts, VolumeBindingMode, VolumeDetails, VolumeMode},
    driver::PvTestDriver,
    error::{Error, Result},
    quantity,
    snapshot::SNAPSHOT_API_GROUP,
};
use k8s_openapi::{
    api::{
        core::v1::{
            PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
            TypedLocalObjectReference, VolumeResourceRequirements,
        },
        storage::v1::StorageClass,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{api::ObjectMeta, Api, Client, ResourceExt};
use maplit::btreemap;
use std::{collections::BTreeMap, time::Duration};
use tracing::info;

const CLAIM_BOUND_PHASE: &str = "Bound";

#[derive(Clone)]
pub struct TestStorageClass {
    client: Client,
    storage_class: StorageClass,
}

impl TestStorageClass {
    pub fn new(client: Client, storage_class: StorageClass) -> Self {
        Self {
            client,
            storage_class,
        }
    }

    pub fn storage_class(&self) -> &StorageClass {
        &self.storage_class
    }

    pub async fn create(&mut self) -> Result<()> {
        self.storage_class = self
            .client
            .create_cluster_resource(&self.storage_class)
            .await?;

        info!(name = %self.storage_class.name_any(), "created storage class");
        Ok(())
    }

    pub async fn cleanup(&self) -> Result<()> {
        let name = self
            .storage_class
            .metadata
            .name
            .clone()
            .ok_or(Error::NotCreated("storage class"))?;
        let api: Api<StorageClass> = Api::all(self.client.clone());

        info!(name = %name, "deleting storage class");
        self.client.delete_resource(&api, &name).await?;

        Ok(())
    }
}

/// Builds the claim requested for a volume; the server assigns the name.
pub fn build_persistent_volume_claim(
    namespace: &str,
    claim_size: &str,
    volume_mode: VolumeMode,
    storage_class_name: Option<&str>,
    data_source: Option<&DataSource>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            generate_name: Some("pvc-".to_owned()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(btreemap! {
                    "storage".to_owned() => Quantity(claim_size.to_owned()),
                }),
                ..Default::default()
            }),
            storage_class_name: storage_class_name.map(str::to_owned),
            volume_mode: Some(volume_mode.as_str().to_owned()),
            data_source: data_source.map(|source| TypedLocalObjectReference {
                api_group: (source.kind == crate::config::VOLUME_SNAPSHOT_KIND)
                    .then(|| SNAPSHOT_API_GROUP.to_owned()),
                kind: source.kind.clone(),
                name: source.name.clone(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn requested_storage(claim: &PersistentVolumeClaim) -> Option<&Quantity> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
}

/// Checks that `volume` was provisioned by `driver_name` for `claim` with
/// the requested size and reclaim policy.
pub fn validate_provisioned_volume(
    claim: &PersistentVolumeClaim,
    volume: &PersistentVolume,
    driver_name: &str,
    reclaim_policy: ReclaimPolicy,
) -> Result<()> {
    let volume_name = volume.name_any();
    let invalid = |reason: String| Error::VolumeValidation {
        volume: volume_name.clone(),
        reason,
    };

    let spec = volume
        .spec
        .as_ref()
        .ok_or_else(|| invalid("missing spec".into()))?;

    let driver = spec.csi.as_ref().map(|csi| csi.driver.as_str());
    if driver != Some(driver_name) {
        return Err(invalid(format!(
            "expected CSI driver {}, found {:?}",
            driver_name, driver
        )));
    }

    let requested = requested_storage(claim)
        .ok_or_else(|| invalid("claim does not request any storage".into()))?;
    let capacity = spec
        .capacity
        .as_ref()
        .and_then(|capacity| capacity.get("storage"))
        .ok_or_else(|| invalid("volume has no storage capacity".into()))?;
    let requested_bytes = quantity::to_bytes(requested).map_err(|e| invalid(e.to_string()))?;
    let capacity_bytes = quantity::to_bytes(capacity).map_err(|e| invalid(e.to_string()))?;
    if requested_bytes != capacity_bytes {
        return Err(invalid(format!(
            "expected capacity {}, found {}",
            requested.0, capacity.0
        )));
    }

    let claim_ref = spec.claim_ref.as_ref().and_then(|r| r.name.as_deref());
    if claim_ref != claim.metadata.name.as_deref() {
        return Err(invalid(format!(
            "expected claim {:?}, bound to {:?}",
            claim.metadata.name, claim_ref
        )));
    }

    let policy = spec.persistent_volume_reclaim_policy.as_deref();
    if policy != Some(reclaim_policy.as_str()) {
        return Err(invalid(format!(
            "expected reclaim policy {}, found {:?}",
            reclaim_policy.as_str(),
            policy
        )));
    }

    Ok(())
}

#[derive(Clone)]
pub struct TestPersistentVolumeClaim {
    client: Client,
    namespace: String,
    driver_name: String,
    reclaim_policy: ReclaimPolicy,
    requested: PersistentVolumeClaim,
    persistent_volume_claim: Option<PersistentVolumeClaim>,
    persistent_volume: Option<PersistentVolume>,
}

impl TestPersistentVolumeClaim {
    pub fn new(
        client: Client,
        namespace: &str,
        driver_name: &str,
        volume: &VolumeDetails,
        storage_class: &StorageClass,
    ) -> Self {
        let requested = build_persistent_volume_claim(
            namespace,
            &volume.claim_size,
            volume.volume_mode,
            storage_class.metadata.name.as_deref(),
            volume.data_source.as_ref(),
        );

        Self {
            client,
            namespace: namespace.to_owned(),
            driver_name: driver_name.to_owned(),
            reclaim_policy: volume.reclaim_policy,
            requested,
            persistent_volume_claim: None,
            persistent_volume: None,
        }
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn persistent_volume_claim(&self) -> Result<&PersistentVolumeClaim> {
        self.persistent_volume_claim
            .as_ref()
            .ok_or(Error::NotCreated("persistent volume claim"))
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.persistent_volume_claim()?.name_any())
    }

    pub async fn create(&mut self) -> Result<()> {
        let claim = self
            .client
            .create_namespaced_resource(&self.namespace, &self.requested)
            .await?;

        info!(name = %claim.name_any(), "created persistent volume claim");
        self.persistent_volume_claim = Some(claim);

        Ok(())
    }

    pub async fn wait_for_bound(&mut self, timeout: Duration) -> Result<()> {
        let api = self.claims();
        let name = self.name()?;

        info!(name = %name, "waiting for persistent volume claim to be bound");
        let claim = poll_until(timeout, || async {
            let claim = api
                .get(&name)
                .await
                .map_err(retry_error::<Error>)?;
            let phase = claim
                .status
                .as_ref()
                .and_then(|status| status.phase.clone())
                .unwrap_or_default();

            if phase == CLAIM_BOUND_PHASE {
                Ok(claim)
            } else {
                Err(backoff::Error::transient(Error::ClaimNotBound {
                    name: name.clone(),
                    phase,
                }))
            }
        })
        .await?;

        let volume_name = claim
            .spec
            .as_ref()
            .and_then(|spec| spec.volume_name.clone())
            .ok_or(Error::NotCreated("persistent volume"))?;
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let volume = volumes.get(&volume_name).await?;

        info!(claim = %name, volume = %volume_name, "persistent volume claim is bound");
        self.persistent_volume_claim = Some(claim);
        self.persistent_volume = Some(volume);

        Ok(())
    }

    pub fn validate_provisioned_volume(&self) -> Result<()> {
        let claim = self.persistent_volume_claim()?;
        let volume = self
            .persistent_volume
            .as_ref()
            .ok_or(Error::NotCreated("persistent volume"))?;

        validate_provisioned_volume(claim, volume, &self.driver_name, self.reclaim_policy)
    }

    /// Deletes the claim, and with a `Delete` reclaim policy waits for the
    /// bound volume to be released by the driver.
    pub async fn cleanup(&self, timeout: Duration) -> Result<()> {
        let api = self.claims();
        let name = self.name()?;

        let volume_name = match api.get_opt(&name).await? {
            Some(claim) => claim.spec.and_then(|spec| spec.volume_name),
            None => None,
        };

        info!(name = %name, "deleting persistent volume claim");
        self.client.delete_resource(&api, &name).await?;
        self.client.wait_for_deletion(&api, &name, timeout).await?;

        match (volume_name, self.reclaim_policy) {
            (Some(volume_name), ReclaimPolicy::Delete) => {
                info!(name = %volume_name, "waiting for persistent volume to be deleted");
                let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
                self.client
                    .wait_for_deletion(&volumes, &volume_name, timeout)
                    .await?;
            }
            (Some(volume_name), ReclaimPolicy::Retain) => {
                info!(name = %volume_name, "persistent volume is retained");
            }
            (None, _) => {}
        }

        Ok(())
    }
}

impl VolumeDetails {
    /// Creates a storage class and a claim for this volume, registering
    /// their cleanups.  With immediate binding the claim is also waited on
    /// and its volume validated.
    pub async fn setup_dynamic_persistent_volume_claim(
        &self,
        client: &Client,
        namespace: &str,
        driver: &dyn PvTestDriver,
        storage_class_parameters: &BTreeMap<String, String>,
        timeouts: &Timeouts,
        cleanups: &mut CleanupStack,
    ) -> Result<TestPersistentVolumeClaim> {
        info!("setting up the storage class");
        let mut tsc = TestStorageClass::new(
            client.clone(),
            driver.dynamic_storage_class(
                storage_class_parameters,
                self.reclaim_policy,
                self.volume_binding_mode,
                namespace,
            ),
        );
        tsc.create().await?;
        {
            let tsc = tsc.clone();
            cleanups.defer(
                format!("delete storage class {}", tsc.storage_class().name_any()),
                async move { tsc.cleanup().await },
            );
        }

        info!("setting up the persistent volume claim");
        let mut tpvc = TestPersistentVolumeClaim::new(
            client.clone(),
            namespace,
            driver.driver_name(),
            self,
            tsc.storage_class(),
        );
        tpvc.create().await?;
        {
            let tpvc = tpvc.clone();
            let timeout = timeouts.deletion();
            cleanups.defer(
                format!("delete persistent volume claim {}", tpvc.name()?),
                async move { tpvc.cleanup(timeout).await },
            );
        }

        if self.volume_binding_mode == VolumeBindingMode::Immediate {
            tpvc.wait_for_bound(timeouts.claim_bound()).await?;
            tpvc.validate_provisioned_volume()?;
        }

        Ok(tpvc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, ObjectReference, PersistentVolumeSpec,
    };
    use pretty_assertions::assert_eq;

    fn bound_claim() -> PersistentVolumeClaim {
        let mut claim = build_persistent_volume_claim(
            "azuredisk-1234",
            "10Gi",
            VolumeMode::Filesystem,
            Some("azuredisk-1234-disk-csi-azure-com-dynamic-sc-abcde"),
            None,
        );
        claim.metadata.name = Some("pvc-abcde".into());
        claim
    }

    fn provisioned_volume() -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pvc-0f1e2d3c".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(btreemap! {
                    "storage".to_owned() => Quantity("10Gi".into()),
                }),
                claim_ref: Some(ObjectReference {
                    name: Some("pvc-abcde".into()),
                    namespace: Some("azuredisk-1234".into()),
                    ..Default::default()
                }),
                csi: Some(CSIPersistentVolumeSource {
                    driver: "disk.csi.azure.com".into(),
                    volume_handle: "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/pvc-0f1e2d3c".into(),
                    ..Default::default()
                }),
                persistent_volume_reclaim_policy: Some("Delete".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_claim_from_snapshot() {
        let claim = build_persistent_volume_claim(
            "azuredisk-1234",
            "10Gi",
            VolumeMode::Block,
            Some("sc-1"),
            Some(&DataSource::volume_snapshot("volume-snapshot-abcde")),
        );
        let spec = claim.spec.unwrap();

        assert_eq!(claim.metadata.generate_name.as_deref(), Some("pvc-"));
        assert_eq!(claim.metadata.namespace.as_deref(), Some("azuredisk-1234"));
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        assert_eq!(spec.storage_class_name.as_deref(), Some("sc-1"));
        assert_eq!(spec.volume_mode.as_deref(), Some("Block"));
        assert_eq!(
            spec.resources.unwrap().requests,
            Some(btreemap! { "storage".to_string() => Quantity("10Gi".into()) })
        );
        assert_eq!(
            spec.data_source,
            Some(TypedLocalObjectReference {
                api_group: Some("snapshot.storage.k8s.io".into()),
                kind: "VolumeSnapshot".into(),
                name: "volume-snapshot-abcde".into(),
            })
        );
    }

    #[test]
    fn test_build_claim_cloned_from_claim() {
        let source = DataSource {
            kind: "PersistentVolumeClaim".into(),
            name: "pvc-abcde".into(),
        };

        let claim = build_persistent_volume_claim(
            "azuredisk-1234",
            "10Gi",
            VolumeMode::Filesystem,
            None,
            Some(&source),
        );
        let data_source = claim.spec.unwrap().data_source.unwrap();

        assert_eq!(data_source.api_group, None);
        assert_eq!(data_source.kind, "PersistentVolumeClaim");
    }

    #[test]
    fn test_validate_provisioned_volume() {
        validate_provisioned_volume(
            &bound_claim(),
            &provisioned_volume(),
            "disk.csi.azure.com",
            ReclaimPolicy::Delete,
        )
        .expect("volume should be valid");
    }

    #[test]
    fn test_validate_rejects_other_driver() {
        let err = validate_provisioned_volume(
            &bound_claim(),
            &provisioned_volume(),
            "file.csi.azure.com",
            ReclaimPolicy::Delete,
        )
        .unwrap_err();

        assert!(matches!(err, Error::VolumeValidation { ref reason, .. } if reason.contains("file.csi.azure.com")));
    }

    #[test]
    fn test_validate_rejects_wrong_capacity() {
        let mut volume = provisioned_volume();
        volume.spec.as_mut().unwrap().capacity = Some(btreemap! {
            "storage".to_owned() => Quantity("20Gi".into()),
        });

        let err = validate_provisioned_volume(
            &bound_claim(),
            &volume,
            "disk.csi.azure.com",
            ReclaimPolicy::Delete,
        )
        .unwrap_err();

        assert!(matches!(err, Error::VolumeValidation { ref reason, .. } if reason.contains("20Gi")));
    }

    #[test]
    fn test_validate_compares_capacity_by_value() {
        let mut claim = bound_claim();
        claim.spec.as_mut().unwrap().resources = Some(VolumeResourceRequirements {
            requests: Some(btreemap! {
                "storage".to_owned() => Quantity("10240Mi".into()),
            }),
            ..Default::default()
        });

        assert!(validate_provisioned_volume(
            &claim,
            &provisioned_volume(),
            "disk.csi.azure.com",
            ReclaimPolicy::Delete,
        )
        .is_ok());
    }

    #[test]
    fn test_validate_rejects_unparsable_capacity() {
        let mut volume = provisioned_volume();
        volume.spec.as_mut().unwrap().capacity = Some(btreemap! {
            "storage".to_owned() => Quantity("ten gigs".into()),
        });

        let err = validate_provisioned_volume(
            &bound_claim(),
            &volume,
            "disk.csi.azure.com",
            ReclaimPolicy::Delete,
        )
        .unwrap_err();

        assert!(matches!(err, Error::VolumeValidation { ref reason, .. } if reason.contains("ten gigs")));
    }

    #[test]
    fn test_validate_rejects_foreign_claim() {
        let mut volume = provisioned_volume();
        volume.spec.as_mut().unwrap().claim_ref = Some(ObjectReference {
            name: Some("pvc-other".into()),
            ..Default::default()
        });

        let err = validate_provisioned_volume(
            &bound_claim(),
            &volume,
            "disk.csi.azure.com",
            ReclaimPolicy::Delete,
        )
        .unwrap_err();

        assert!(matches!(err, Error::VolumeValidation { .. }));
    }

    #[test]
    fn test_validate_rejects_wrong_reclaim_policy() {
        let err = validate_provisioned_volume(
            &bound_claim(),
            &provisioned_volume(),
            "disk.csi.azure.com",
            ReclaimPolicy::Retain,
        )
        .unwrap_err();

        assert!(matches!(err, Error::VolumeValidation { ref reason, .. } if reason.contains("Retain")));
    }
}
