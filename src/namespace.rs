use crate::{
    clients::kubernetes::ClientHelpers,
    error::{Error, Result},
};
use k8s_openapi::api::core::v1::Namespace;
use kube::{api::ObjectMeta, Api, Client, ResourceExt};
use maplit::btreemap;
use std::time::Duration;
use tracing::info;

pub const E2E_LABEL: &str = "e2e-framework";
pub const DEFAULT_BASE_NAME: &str = "azuredisk";

pub fn build_namespace(base_name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", base_name)),
            labels: Some(btreemap! {
                E2E_LABEL.to_owned() => base_name.to_owned(),
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct TestNamespace {
    client: Client,
    name: String,
    owned: bool,
}

impl TestNamespace {
    pub async fn create(client: Client, base_name: &str) -> Result<Self> {
        let namespace = client
            .create_cluster_resource(&build_namespace(base_name))
            .await?;
        let name = namespace.name_any();

        info!(name = %name, "created test namespace");
        Ok(Self {
            client,
            name,
            owned: true,
        })
    }

    /// Wraps an existing namespace; it is never deleted.
    pub fn existing(client: Client, name: &str) -> Self {
        Self {
            client,
            name: name.to_owned(),
            owned: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn cleanup(&self, timeout: Duration) -> Result<()> {
        if !self.owned {
            info!(name = %self.name, "leaving pre-existing namespace in place");
            return Ok(());
        }

        let api: Api<Namespace> = Api::all(self.client.clone());

        info!(name = %self.name, "deleting test namespace");
        self.client.delete_resource(&api, &self.name).await?;
        self.client
            .wait_for_deletion(&api, &self.name, timeout)
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_namespace() {
        let namespace = build_namespace("azuredisk");

        assert_eq!(namespace.metadata.name, None);
        assert_eq!(namespace.metadata.generate_name.as_deref(), Some("azuredisk-"));
        assert_eq!(
            namespace.metadata.labels,
            Some(btreemap! {
                "e2e-framework".to_string() => "azuredisk".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_existing_namespace_is_left_in_place() {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let namespace = TestNamespace::existing(Client::try_from(config).unwrap(), "shared");

        assert_eq!(namespace.name(), "shared");
        namespace.cleanup(Duration::from_secs(1)).await.unwrap();
    }
}
