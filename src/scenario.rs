use crate::{
    cleanup::{finish, CleanupStack},
    clients::{azure::CloudClient, credentials::CredentialFile},
    config::{DataSource, PodDetails, ScenarioConfig, Timeouts, VolumeDetails, VolumeMode},
    driver::{CsiDriver, PvTestDriver},
    error::{Error, Result},
    pod::{test_label, test_pod_anti_affinity, TestPod},
    resource_group::ExternalResourceGroup,
    snapshot::TestVolumeSnapshotClass,
};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{Client, ResourceExt};
use std::{collections::BTreeMap, sync::Arc};
use tracing::info;

const RESOURCE_GROUP_PARAMETER: &str = "resourceGroup";

/// Provisions a volume, writes to it, snapshots it into an external
/// resource group and checks the data from a volume restored from that
/// snapshot.  Only the first volume of `pod` is used.
pub struct DynamicallyProvisionedVolumeSnapshotTest {
    pub csi_driver: Arc<dyn PvTestDriver>,
    pub pod: PodDetails,
    pub should_overwrite: bool,
    pub pod_overwrite: PodDetails,
    pub pod_with_snapshot: PodDetails,
    pub storage_class_parameters: BTreeMap<String, String>,
    pub snapshot_storage_class_parameters: BTreeMap<String, String>,
    pub is_windows_hpc_deployment: bool,
    pub credential_file: CredentialFile,
    pub timeouts: Timeouts,
}

impl From<&ScenarioConfig> for DynamicallyProvisionedVolumeSnapshotTest {
    fn from(config: &ScenarioConfig) -> Self {
        Self {
            csi_driver: Arc::new(CsiDriver::new(&config.driver)),
            pod: config.pod.clone(),
            should_overwrite: config.should_overwrite,
            pod_overwrite: config.pod_overwrite.clone(),
            pod_with_snapshot: config.pod_with_snapshot.clone(),
            storage_class_parameters: config.storage_class_parameters.clone(),
            snapshot_storage_class_parameters: config.snapshot_storage_class_parameters.clone(),
            is_windows_hpc_deployment: config.is_windows_hpc_deployment,
            credential_file: CredentialFile::new(&config.credential_file),
            timeouts: config.timeouts.clone(),
        }
    }
}

/// The writer's volume with the snapshot as its data source.
pub fn restore_volume(volume: &VolumeDetails, snapshot_name: &str) -> VolumeDetails {
    VolumeDetails {
        data_source: Some(DataSource::volume_snapshot(snapshot_name)),
        ..volume.clone()
    }
}

fn mount_first_volume(tpod: &mut TestPod, claim: &PersistentVolumeClaim, volume: &VolumeDetails) {
    let name = format!("{}1", volume.volume_mount.name_generate);
    let path = format!("{}1", volume.volume_mount.mount_path_generate);

    match volume.volume_mode {
        VolumeMode::Filesystem => tpod.setup_volume(claim, &name, &path, volume.volume_mount.read_only),
        VolumeMode::Block => tpod.setup_raw_block_volume(claim, &name, &path),
    }
}

impl DynamicallyProvisionedVolumeSnapshotTest {
    /// Two pods on one node would both see the original and the restored
    /// disk with the same filesystem UUID.
    pub fn needs_anti_affinity(&self) -> bool {
        self.should_overwrite && !self.is_windows_hpc_deployment
    }

    /// The overwrite pod runs on the writer pod's Windows Server version.
    pub fn overwrite_pod(&self, client: &Client, namespace: &str) -> TestPod {
        TestPod::new(
            client.clone(),
            namespace,
            &self.pod_overwrite.cmd,
            self.pod_overwrite.is_windows,
            self.pod.win_server_ver.as_deref(),
        )
    }

    pub fn restore_pod_details(&self, snapshot_name: &str) -> Result<PodDetails> {
        let volume = self.pod.volumes.first().ok_or(Error::NoVolumes)?;

        Ok(PodDetails {
            volumes: vec![restore_volume(volume, snapshot_name)],
            ..self.pod_with_snapshot.clone()
        })
    }

    /// Runs the scenario, then tears down everything it created in reverse
    /// order whether or not it succeeded.
    pub async fn run(&self, client: &Client, namespace: &str) -> Result<()> {
        let mut cleanups = CleanupStack::new();
        let result = self.execute(client, namespace, &mut cleanups).await;

        finish(result, cleanups).await
    }

    async fn execute(
        &self,
        client: &Client,
        namespace: &str,
        cleanups: &mut CleanupStack,
    ) -> Result<()> {
        let driver = self.csi_driver.as_ref();
        let volume = self.pod.volumes.first().ok_or(Error::NoVolumes)?;

        let tpvc = volume
            .setup_dynamic_persistent_volume_claim(
                client,
                namespace,
                driver,
                &self.storage_class_parameters,
                &self.timeouts,
                cleanups,
            )
            .await?;
        let claim = tpvc.persistent_volume_claim()?.clone();

        let mut tpod = TestPod::new(
            client.clone(),
            namespace,
            &self.pod.cmd,
            self.pod.is_windows,
            self.pod.win_server_ver.as_deref(),
        );
        mount_first_volume(&mut tpod, &claim, volume);

        info!("deploying the pod");
        tpod.create().await?;
        self.defer_pod_cleanup(cleanups, &tpod)?;

        info!("checking that the pod's command exits with no error");
        tpod.wait_for_success(self.timeouts.pod_start()).await?;

        info!(
            seconds = self.timeouts.settle_seconds,
            "waiting for the data to be written to the disk"
        );
        tokio::time::sleep(self.timeouts.settle()).await;

        info!("checking the test resource group");
        let credentials = self.credential_file.create().await?;
        {
            let credential_file = self.credential_file.clone();
            cleanups.defer("delete credential file", async move {
                Ok(credential_file.delete().await?)
            });
        }
        info!(resource_group = %credentials.resource_group, "using test resource group");

        let cloud = CloudClient::from_credentials(&credentials)?;
        let external_rg = ExternalResourceGroup::create(cloud, &credentials.location).await?;
        {
            let external_rg = external_rg.clone();
            let timeout = self.timeouts.resource_group_deletion();
            cleanups.defer(
                format!("delete resource group {}", external_rg.name()),
                async move { external_rg.delete(timeout).await },
            );
        }

        info!(resource_group = %external_rg.name(), "creating volume snapshot class with external resource group");
        let mut tvsc = TestVolumeSnapshotClass::new(
            client.clone(),
            namespace,
            driver.volume_snapshot_class(&self.snapshot_storage_class_parameters, namespace),
        );
        tvsc.set_parameter(RESOURCE_GROUP_PARAMETER, external_rg.name());
        tvsc.create().await?;
        {
            let tvsc = tvsc.clone();
            cleanups.defer(
                format!(
                    "delete volume snapshot class {}",
                    tvsc.volume_snapshot_class().name_any()
                ),
                async move { tvsc.cleanup().await },
            );
        }

        info!("taking snapshots");
        let snapshot = tvsc.create_snapshot(&claim).await?;

        if self.should_overwrite {
            let mut overwrite = self.overwrite_pod(client, namespace);
            mount_first_volume(&mut overwrite, &claim, volume);
            overwrite.set_label(&test_label());

            info!("deploying a new pod to overwrite pv data");
            overwrite.create().await?;
            self.defer_pod_cleanup(cleanups, &overwrite)?;

            info!("checking that the pod is running");
            overwrite.wait_for_running(self.timeouts.pod_start()).await?;
        }

        {
            let tvsc = tvsc.clone();
            let snapshot = snapshot.clone();
            let timeout = self.timeouts.deletion();
            cleanups.defer(
                format!("delete volume snapshot {}", snapshot.name_any()),
                async move { tvsc.delete_snapshot(&snapshot, timeout).await },
            );
        }
        tvsc.ready_to_use(&snapshot, self.timeouts.snapshot_ready())
            .await?;

        let mut restored = self
            .restore_pod_details(&snapshot.name_any())?
            .setup_with_dynamic_volumes(
                client,
                namespace,
                driver,
                &self.storage_class_parameters,
                &self.timeouts,
                cleanups,
            )
            .await?;

        if self.needs_anti_affinity() {
            info!("setting pod anti-affinity so both pods land on different nodes");
            restored.set_affinity(test_pod_anti_affinity());
        }

        info!("deploying a pod with a volume restored from the snapshot");
        restored.create().await?;
        self.defer_pod_cleanup(cleanups, &restored)?;

        info!("checking that the pod's command exits with no error");
        restored.wait_for_success(self.timeouts.pod_start()).await
    }

    fn defer_pod_cleanup(&self, cleanups: &mut CleanupStack, tpod: &TestPod) -> Result<()> {
        let tpod = tpod.clone();
        let timeout = self.timeouts.deletion();

        cleanups.defer(format!("delete pod {}", tpod.name()?), async move {
            tpod.cleanup(timeout).await
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VolumeBindingMode, VOLUME_SNAPSHOT_KIND};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn scenario() -> DynamicallyProvisionedVolumeSnapshotTest {
        DynamicallyProvisionedVolumeSnapshotTest::from(&ScenarioConfig::default())
    }

    #[test]
    fn test_from_config() {
        let test = scenario();

        assert_eq!(test.csi_driver.driver_name(), "disk.csi.azure.com");
        assert!(test.should_overwrite);
        assert_eq!(test.pod.volumes.len(), 1);
        assert_eq!(
            test.credential_file.path(),
            std::path::Path::new("/tmp/azure.json")
        );
    }

    #[test]
    fn test_restore_volume_keeps_writer_settings() {
        let volume = VolumeDetails::builder()
            .claim_size("20Gi".to_string())
            .volume_binding_mode(VolumeBindingMode::Immediate)
            .build();

        let restored = restore_volume(&volume, "volume-snapshot-abcde");

        assert_eq!(restored.claim_size, "20Gi");
        assert_eq!(restored.volume_binding_mode, VolumeBindingMode::Immediate);
        assert_eq!(
            restored.data_source,
            Some(DataSource {
                kind: VOLUME_SNAPSHOT_KIND.to_string(),
                name: "volume-snapshot-abcde".to_string(),
            })
        );
        assert_eq!(volume.data_source, None);
    }

    #[test]
    fn test_restore_pod_details() {
        let test = scenario();

        let details = test.restore_pod_details("volume-snapshot-abcde").unwrap();

        assert_eq!(details.cmd, test.pod_with_snapshot.cmd);
        assert_eq!(details.volumes.len(), 1);
        assert_eq!(
            details.volumes[0].data_source.as_ref().map(|d| d.name.as_str()),
            Some("volume-snapshot-abcde")
        );
    }

    #[test]
    fn test_restore_pod_details_without_volumes() {
        let mut test = scenario();
        test.pod.volumes.clear();

        assert!(matches!(
            test.restore_pod_details("volume-snapshot-abcde"),
            Err(Error::NoVolumes)
        ));
    }

    #[rstest]
    #[case(true, false, true)]
    #[case(true, true, false)]
    #[case(false, false, false)]
    #[case(false, true, false)]
    fn test_needs_anti_affinity(
        #[case] should_overwrite: bool,
        #[case] is_windows_hpc_deployment: bool,
        #[case] expected: bool,
    ) {
        let mut test = scenario();
        test.should_overwrite = should_overwrite;
        test.is_windows_hpc_deployment = is_windows_hpc_deployment;

        assert_eq!(test.needs_anti_affinity(), expected);
    }

    #[tokio::test]
    async fn test_overwrite_pod_uses_writer_windows_version() {
        let mut test = scenario();
        test.pod.is_windows = true;
        test.pod.win_server_ver = Some("ltsc2022".to_string());
        test.pod_overwrite.is_windows = true;
        test.pod_overwrite.win_server_ver = Some("ltsc2019".to_string());

        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let pod = test.overwrite_pod(&client, "azuredisk-1234");

        assert_eq!(
            pod.pod().spec.as_ref().unwrap().containers[0].image.as_deref(),
            Some("mcr.microsoft.com/windows/servercore:ltsc2022")
        );
    }

    #[tokio::test]
    async fn test_run_requires_a_volume() {
        let mut test = scenario();
        test.pod.volumes.clear();

        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).unwrap();

        assert!(matches!(
            test.run(&client, "azuredisk-1234").await,
            Err(Error::NoVolumes)
        ));
    }
}
