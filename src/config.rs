use maplit::btreemap;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};
use thiserror::Error;
use typed_builder::TypedBuilder;

pub const DEFAULT_DRIVER_NAME: &str = "disk.csi.azure.com";
pub const VOLUME_SNAPSHOT_KIND: &str = "VolumeSnapshot";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read scenario file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse scenario file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
}

impl ReclaimPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimPolicy::Delete => "Delete",
            ReclaimPolicy::Retain => "Retain",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub enum VolumeBindingMode {
    #[default]
    Immediate,
    WaitForFirstConsumer,
}

impl VolumeBindingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeBindingMode::Immediate => "Immediate",
            VolumeBindingMode::WaitForFirstConsumer => "WaitForFirstConsumer",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

impl VolumeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeMode::Filesystem => "Filesystem",
            VolumeMode::Block => "Block",
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(default)]
pub struct VolumeMountDetails {
    #[builder(default = "test-volume-".to_owned())]
    pub name_generate: String,

    #[builder(default = "/mnt/test-".to_owned())]
    pub mount_path_generate: String,

    #[builder(default)]
    pub read_only: bool,
}

impl Default for VolumeMountDetails {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A data source a new claim is populated from.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DataSource {
    pub kind: String,
    pub name: String,
}

impl DataSource {
    pub fn volume_snapshot(name: &str) -> Self {
        Self {
            kind: VOLUME_SNAPSHOT_KIND.to_owned(),
            name: name.to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(default)]
pub struct VolumeDetails {
    #[builder(default = "10Gi".to_owned())]
    pub claim_size: String,

    #[builder(default)]
    pub reclaim_policy: ReclaimPolicy,

    #[builder(default)]
    pub volume_binding_mode: VolumeBindingMode,

    #[builder(default)]
    pub volume_mode: VolumeMode,

    #[builder(default)]
    pub volume_mount: VolumeMountDetails,

    #[builder(default)]
    pub data_source: Option<DataSource>,
}

impl Default for VolumeDetails {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(default)]
pub struct PodDetails {
    pub cmd: String,

    #[builder(default)]
    pub is_windows: bool,

    /// Windows Server image tag, e.g. `ltsc2022`.
    #[builder(default)]
    pub win_server_ver: Option<String>,

    #[builder(default)]
    pub volumes: Vec<VolumeDetails>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(default)]
pub struct Timeouts {
    #[builder(default = 15 * 60)]
    pub pod_start_seconds: u64,

    #[builder(default = 5 * 60)]
    pub claim_bound_seconds: u64,

    #[builder(default = 15 * 60)]
    pub snapshot_ready_seconds: u64,

    #[builder(default = 5 * 60)]
    pub deletion_seconds: u64,

    #[builder(default = 10 * 60)]
    pub namespace_deletion_seconds: u64,

    #[builder(default = 10 * 60)]
    pub resource_group_deletion_seconds: u64,

    /// How long to wait after the writer pod exits before snapshotting.
    #[builder(default = 10)]
    pub settle_seconds: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Timeouts {
    pub fn pod_start(&self) -> Duration {
        Duration::from_secs(self.pod_start_seconds)
    }

    pub fn claim_bound(&self) -> Duration {
        Duration::from_secs(self.claim_bound_seconds)
    }

    pub fn snapshot_ready(&self) -> Duration {
        Duration::from_secs(self.snapshot_ready_seconds)
    }

    pub fn deletion(&self) -> Duration {
        Duration::from_secs(self.deletion_seconds)
    }

    pub fn namespace_deletion(&self) -> Duration {
        Duration::from_secs(self.namespace_deletion_seconds)
    }

    pub fn resource_group_deletion(&self) -> Duration {
        Duration::from_secs(self.resource_group_deletion_seconds)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }
}

/// Everything needed to run the snapshot/restore scenario.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub driver: String,
    pub pod: PodDetails,
    pub should_overwrite: bool,
    pub pod_overwrite: PodDetails,
    pub pod_with_snapshot: PodDetails,
    pub storage_class_parameters: BTreeMap<String, String>,
    pub snapshot_storage_class_parameters: BTreeMap<String, String>,
    pub is_windows_hpc_deployment: bool,
    pub credential_file: String,
    pub timeouts: Timeouts,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            driver: DEFAULT_DRIVER_NAME.to_owned(),
            pod: PodDetails::builder()
                .cmd("echo 'hello world' > /mnt/test-1/data && grep 'hello world' /mnt/test-1/data".into())
                .volumes(vec![VolumeDetails::default()])
                .build(),
            should_overwrite: true,
            pod_overwrite: PodDetails::builder()
                .cmd("echo 'overwrite' > /mnt/test-1/data; sleep 3600".into())
                .build(),
            pod_with_snapshot: PodDetails::builder()
                .cmd("grep 'hello world' /mnt/test-1/data".into())
                .build(),
            storage_class_parameters: btreemap! {
                "skuName".to_owned() => "StandardSSD_LRS".to_owned(),
            },
            snapshot_storage_class_parameters: btreemap! {
                "incremental".to_owned() => "false".to_owned(),
            },
            is_windows_hpc_deployment: false,
            credential_file: crate::clients::credentials::TEMP_CREDENTIAL_FILE_PATH.to_owned(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ScenarioConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}
