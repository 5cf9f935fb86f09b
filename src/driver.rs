use crate::{
    config::{ReclaimPolicy, VolumeBindingMode},
    snapshot::VolumeSnapshotClass,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// Produces the storage and snapshot classes used to provision volumes
/// through the driver under test.
pub trait PvTestDriver {
    fn driver_name(&self) -> &str;

    fn dynamic_storage_class(
        &self,
        parameters: &BTreeMap<String, String>,
        reclaim_policy: ReclaimPolicy,
        binding_mode: VolumeBindingMode,
        namespace: &str,
    ) -> StorageClass;

    fn volume_snapshot_class(
        &self,
        parameters: &BTreeMap<String, String>,
        namespace: &str,
    ) -> VolumeSnapshotClass;
}

#[derive(Clone, Debug)]
pub struct CsiDriver {
    name: String,
}

impl CsiDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }

    /// Prefix for generated class names, e.g.
    /// `azuredisk-1234-disk-csi-azure-com-dynamic-sc-`.
    fn generate_name(&self, namespace: &str) -> String {
        format!(
            "{}-{}-dynamic-sc-",
            namespace,
            normalize_provisioner_name(&self.name)
        )
    }
}

/// Replaces everything that is not valid in an object name with `-`.
pub fn normalize_provisioner_name(provisioner: &str) -> String {
    provisioner
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

impl PvTestDriver for CsiDriver {
    fn driver_name(&self) -> &str {
        &self.name
    }

    fn dynamic_storage_class(
        &self,
        parameters: &BTreeMap<String, String>,
        reclaim_policy: ReclaimPolicy,
        binding_mode: VolumeBindingMode,
        namespace: &str,
    ) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                generate_name: Some(self.generate_name(namespace)),
                ..Default::default()
            },
            provisioner: self.name.clone(),
            parameters: Some(parameters.clone()).filter(|p| !p.is_empty()),
            reclaim_policy: Some(reclaim_policy.as_str().to_owned()),
            volume_binding_mode: Some(binding_mode.as_str().to_owned()),
            allow_volume_expansion: Some(true),
            ..Default::default()
        }
    }

    fn volume_snapshot_class(
        &self,
        parameters: &BTreeMap<String, String>,
        namespace: &str,
    ) -> VolumeSnapshotClass {
        let mut class = VolumeSnapshotClass::new(
            ObjectMeta {
                generate_name: Some(self.generate_name(namespace)),
                ..Default::default()
            },
            &self.name,
        );
        class.parameters = Some(parameters.clone()).filter(|p| !p.is_empty());

        class
    }
}
