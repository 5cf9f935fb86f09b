use crate::{
    cleanup::CleanupStack,
    clients::kubernetes::{poll_until, retry_error, ClientHelpers},
    config::{PodDetails, Timeouts, VolumeMode},
    driver::PvTestDriver,
    error::{Error, Result},
};
use k8s_openapi::{
    api::core::v1::{
        Affinity, Container, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod,
        PodAffinityTerm, PodAntiAffinity, PodSpec, Toleration, Volume, VolumeDevice, VolumeMount,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
};
use kube::{
    api::{LogParams, ObjectMeta},
    Api, Client, ResourceExt,
};
use maplit::btreemap;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, info, warn};

pub const TEST_LABEL_KEY: &str = "app";
pub const TEST_LABEL_VALUE: &str = "azuredisk-volume-tester";

const LINUX_IMAGE: &str = "registry.k8s.io/e2e-test-images/busybox:1.29-4";
const WINDOWS_IMAGE: &str = "mcr.microsoft.com/windows/servercore";
const DEFAULT_WINDOWS_SERVER_VERSION: &str = "ltsc2019";
const CONTAINER_NAME: &str = "volume-tester";
const OS_LABEL: &str = "kubernetes.io/os";
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
const LOG_TAIL_LINES: i64 = 100;

pub fn test_label() -> BTreeMap<String, String> {
    btreemap! {
        TEST_LABEL_KEY.to_owned() => TEST_LABEL_VALUE.to_owned(),
    }
}

/// Keeps a pod off any node already running a pod labelled with
/// [`test_label`].
pub fn test_pod_anti_affinity() -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: TEST_LABEL_KEY.to_owned(),
                        operator: "In".to_owned(),
                        values: Some(vec![TEST_LABEL_VALUE.to_owned()]),
                    }]),
                    ..Default::default()
                }),
                topology_key: HOSTNAME_TOPOLOGY_KEY.to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_test_pod(
    namespace: &str,
    command: &str,
    is_windows: bool,
    win_server_ver: Option<&str>,
) -> Pod {
    let (image, shell, os) = if is_windows {
        (
            format!(
                "{}:{}",
                WINDOWS_IMAGE,
                win_server_ver.unwrap_or(DEFAULT_WINDOWS_SERVER_VERSION)
            ),
            vec!["powershell.exe".to_owned(), "-Command".to_owned()],
            "windows",
        )
    } else {
        (
            LINUX_IMAGE.to_owned(),
            vec!["/bin/sh".to_owned(), "-c".to_owned()],
            "linux",
        )
    };

    let tolerations = is_windows.then(|| {
        vec![Toleration {
            key: Some("node.kubernetes.io/os".to_owned()),
            operator: Some("Exists".to_owned()),
            effect: Some("NoSchedule".to_owned()),
            ..Default::default()
        }]
    });

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", TEST_LABEL_VALUE)),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_owned(),
                image: Some(image),
                command: Some(shell.into_iter().chain([command.to_owned()]).collect()),
                volume_mounts: Some(vec![]),
                ..Default::default()
            }],
            node_selector: Some(btreemap! {
                OS_LABEL.to_owned() => os.to_owned(),
            }),
            restart_policy: Some("Never".to_owned()),
            tolerations,
            volumes: Some(vec![]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub trait PodExt {
    fn phase(&self) -> &str;
    fn failure_reason(&self) -> String;
}

impl PodExt for Pod {
    fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .unwrap_or("Unknown")
    }

    fn failure_reason(&self) -> String {
        let status = match self.status.as_ref() {
            Some(status) => status,
            None => return "no status reported".to_owned(),
        };

        let terminated = status
            .container_statuses
            .iter()
            .flatten()
            .find_map(|container| {
                container
                    .state
                    .as_ref()
                    .and_then(|state| state.terminated.as_ref())
                    .filter(|terminated| terminated.exit_code != 0)
                    .map(|terminated| {
                        format!(
                            "container {} exited with code {}{}",
                            container.name,
                            terminated.exit_code,
                            terminated
                                .reason
                                .as_ref()
                                .map(|reason| format!(" ({})", reason))
                                .unwrap_or_default()
                        )
                    })
            });

        terminated
            .or_else(|| status.reason.clone())
            .or_else(|| status.message.clone())
            .unwrap_or_else(|| "unknown reason".to_owned())
    }
}

#[derive(Clone)]
pub struct TestPod {
    client: Client,
    namespace: String,
    pod: Pod,
}

impl TestPod {
    pub fn new(
        client: Client,
        namespace: &str,
        command: &str,
        is_windows: bool,
        win_server_ver: Option<&str>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
            pod: build_test_pod(namespace, command, is_windows, win_server_ver),
        }
    }

    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    pub fn name(&self) -> Result<String> {
        self.pod
            .metadata
            .name
            .clone()
            .ok_or(Error::NotCreated("pod"))
    }

    fn spec_mut(&mut self) -> &mut PodSpec {
        self.pod.spec.get_or_insert_with(PodSpec::default)
    }

    fn container_mut(&mut self) -> &mut Container {
        let spec = self.spec_mut();
        if spec.containers.is_empty() {
            spec.containers.push(Container {
                name: CONTAINER_NAME.to_owned(),
                ..Default::default()
            });
        }

        &mut spec.containers[0]
    }

    fn add_claim_volume(&mut self, claim: &PersistentVolumeClaim, name: &str, read_only: bool) {
        self.spec_mut()
            .volumes
            .get_or_insert_with(Vec::new)
            .push(Volume {
                name: name.to_owned(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.name_any(),
                    read_only: Some(read_only),
                }),
                ..Default::default()
            });
    }

    pub fn setup_volume(
        &mut self,
        claim: &PersistentVolumeClaim,
        name: &str,
        mount_path: &str,
        read_only: bool,
    ) {
        self.container_mut()
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: name.to_owned(),
                mount_path: mount_path.to_owned(),
                read_only: Some(read_only),
                ..Default::default()
            });
        self.add_claim_volume(claim, name, read_only);
    }

    pub fn setup_raw_block_volume(
        &mut self,
        claim: &PersistentVolumeClaim,
        name: &str,
        device_path: &str,
    ) {
        self.container_mut()
            .volume_devices
            .get_or_insert_with(Vec::new)
            .push(VolumeDevice {
                name: name.to_owned(),
                device_path: device_path.to_owned(),
            });
        self.add_claim_volume(claim, name, false);
    }

    pub fn set_label(&mut self, labels: &BTreeMap<String, String>) {
        self.pod
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
    }

    pub fn set_affinity(&mut self, affinity: Affinity) {
        self.spec_mut().affinity = Some(affinity);
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub async fn create(&mut self) -> Result<()> {
        self.pod = self
            .client
            .create_namespaced_resource(&self.namespace, &self.pod)
            .await?;

        info!(name = %self.pod.name_any(), "created pod");
        Ok(())
    }

    pub async fn logs(&self) -> Result<String> {
        let name = self.name()?;
        let params = LogParams {
            container: Some(CONTAINER_NAME.to_owned()),
            tail_lines: Some(LOG_TAIL_LINES),
            ..Default::default()
        };

        Ok(self.pods().logs(&name, &params).await?)
    }

    /// Waits for the pod to run to completion; a failed pod is reported with
    /// the tail of its log.
    pub async fn wait_for_success(&self, timeout: Duration) -> Result<()> {
        let api = self.pods();
        let name = self.name()?;

        info!(name = %name, "waiting for pod to succeed");
        poll_until(timeout, || async {
            let pod = api
                .get(&name)
                .await
                .map_err(retry_error::<Error>)?;

            match pod.phase() {
                "Succeeded" => Ok(()),
                "Failed" => {
                    let logs = self
                        .logs()
                        .await
                        .unwrap_or_else(|e| format!("<failed to fetch logs: {}>", e));

                    Err(backoff::Error::permanent(Error::PodFailed {
                        name: name.clone(),
                        reason: pod.failure_reason(),
                        logs,
                    }))
                }
                phase => Err(backoff::Error::transient(Error::PodNotReady {
                    name: name.clone(),
                    phase: phase.to_owned(),
                })),
            }
        })
        .await?;

        info!(name = %name, "pod succeeded");
        Ok(())
    }

    pub async fn wait_for_running(&self, timeout: Duration) -> Result<()> {
        let api = self.pods();
        let name = self.name()?;

        info!(name = %name, "waiting for pod to be running");
        poll_until(timeout, || async {
            let pod = api
                .get(&name)
                .await
                .map_err(retry_error::<Error>)?;

            match pod.phase() {
                "Running" => Ok(()),
                phase @ ("Succeeded" | "Failed") => {
                    Err(backoff::Error::permanent(Error::PodTerminated {
                        name: name.clone(),
                        phase: phase.to_owned(),
                    }))
                }
                phase => Err(backoff::Error::transient(Error::PodNotReady {
                    name: name.clone(),
                    phase: phase.to_owned(),
                })),
            }
        })
        .await?;

        info!(name = %name, "pod is running");
        Ok(())
    }

    /// Dumps the pod's log, deletes it and waits for it to be gone.
    pub async fn cleanup(&self, timeout: Duration) -> Result<()> {
        let api = self.pods();
        let name = self.name()?;

        match self.logs().await {
            Ok(logs) => debug!(name = %name, logs = %logs, "pod logs"),
            Err(e) => warn!(name = %name, error = %e, "failed to fetch pod logs"),
        }

        info!(name = %name, "deleting pod");
        self.client.delete_resource(&api, &name).await?;
        self.client.wait_for_deletion(&api, &name, timeout).await?;

        Ok(())
    }
}

impl PodDetails {
    /// Builds a pod with one freshly provisioned claim per configured
    /// volume, mounted at `<mount_path_generate><n>`.
    pub async fn setup_with_dynamic_volumes(
        &self,
        client: &Client,
        namespace: &str,
        driver: &dyn PvTestDriver,
        storage_class_parameters: &BTreeMap<String, String>,
        timeouts: &Timeouts,
        cleanups: &mut CleanupStack,
    ) -> Result<TestPod> {
        let mut tpod = TestPod::new(
            client.clone(),
            namespace,
            &self.cmd,
            self.is_windows,
            self.win_server_ver.as_deref(),
        );

        for (n, volume) in self.volumes.iter().enumerate() {
            let tpvc = volume
                .setup_dynamic_persistent_volume_claim(
                    client,
                    namespace,
                    driver,
                    storage_class_parameters,
                    timeouts,
                    cleanups,
                )
                .await?;
            let claim = tpvc.persistent_volume_claim()?;
            let name = format!("{}{}", volume.volume_mount.name_generate, n + 1);
            let path = format!("{}{}", volume.volume_mount.mount_path_generate, n + 1);

            match volume.volume_mode {
                VolumeMode::Filesystem => {
                    tpod.setup_volume(claim, &name, &path, volume.volume_mount.read_only)
                }
                VolumeMode::Block => tpod.setup_raw_block_volume(claim, &name, &path),
            }
        }

        Ok(tpod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };
    use pretty_assertions::assert_eq;

    fn pod_with_status(status: Option<PodStatus>) -> Pod {
        Pod {
            status,
            ..Default::default()
        }
    }

    fn terminated_container(name: &str, exit_code: i32, reason: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    reason: reason.map(str::to_string),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_linux_pod() {
        let pod = build_test_pod("azuredisk-1234", "echo 'hello world'", false, None);
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];

        assert_eq!(pod.metadata.generate_name.as_deref(), Some("azuredisk-volume-tester-"));
        assert_eq!(container.image.as_deref(), Some(LINUX_IMAGE));
        assert_eq!(
            container.command,
            Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo 'hello world'".to_string()
            ])
        );
        assert_eq!(
            spec.node_selector,
            Some(btreemap! { "kubernetes.io/os".to_string() => "linux".to_string() })
        );
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.tolerations, None);
    }

    #[test]
    fn test_windows_pod() {
        let pod = build_test_pod("azuredisk-1234", "Get-Content C:\\mnt\\test-1\\data.txt", true, Some("ltsc2022"));
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];

        assert_eq!(
            container.image.as_deref(),
            Some("mcr.microsoft.com/windows/servercore:ltsc2022")
        );
        assert_eq!(
            container.command.as_ref().unwrap()[..2],
            ["powershell.exe".to_string(), "-Command".to_string()]
        );
        assert_eq!(
            spec.node_selector,
            Some(btreemap! { "kubernetes.io/os".to_string() => "windows".to_string() })
        );
        assert_eq!(spec.tolerations.map(|t| t.len()), Some(1));
    }

    #[test]
    fn test_windows_pod_default_version() {
        let pod = build_test_pod("azuredisk-1234", "dir", true, None);

        assert_eq!(
            pod.spec.unwrap().containers[0].image.as_deref(),
            Some("mcr.microsoft.com/windows/servercore:ltsc2019")
        );
    }

    #[test]
    fn test_anti_affinity_targets_test_label() {
        let affinity = test_pod_anti_affinity();
        let terms = affinity
            .pod_anti_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap();

        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");

        let requirement = &terms[0]
            .label_selector
            .as_ref()
            .unwrap()
            .match_expressions
            .as_ref()
            .unwrap()[0];
        assert_eq!(requirement.key, "app");
        assert_eq!(requirement.operator, "In");
        assert_eq!(
            requirement.values,
            Some(vec!["azuredisk-volume-tester".to_string()])
        );
        assert_eq!(test_label().get("app").map(String::as_str), Some("azuredisk-volume-tester"));
    }

    #[test]
    fn test_phase_defaults_to_unknown() {
        assert_eq!(pod_with_status(None).phase(), "Unknown");
        assert_eq!(
            pod_with_status(Some(PodStatus {
                phase: Some("Pending".into()),
                ..Default::default()
            }))
            .phase(),
            "Pending"
        );
    }

    #[test]
    fn test_failure_reason_from_terminated_container() {
        let pod = pod_with_status(Some(PodStatus {
            phase: Some("Failed".into()),
            container_statuses: Some(vec![terminated_container("volume-tester", 1, Some("Error"))]),
            ..Default::default()
        }));

        assert_eq!(
            pod.failure_reason(),
            "container volume-tester exited with code 1 (Error)"
        );
    }

    #[test]
    fn test_failure_reason_skips_successful_containers() {
        let pod = pod_with_status(Some(PodStatus {
            phase: Some("Failed".into()),
            reason: Some("Evicted".into()),
            container_statuses: Some(vec![terminated_container("volume-tester", 0, Some("Completed"))]),
            ..Default::default()
        }));

        assert_eq!(pod.failure_reason(), "Evicted");
    }

    #[test]
    fn test_failure_reason_without_status() {
        assert_eq!(pod_with_status(None).failure_reason(), "no status reported");
        assert_eq!(
            pod_with_status(Some(PodStatus::default())).failure_reason(),
            "unknown reason"
        );
    }
}
