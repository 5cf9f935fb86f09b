use crate::{
    clients::{
        azure::{CloudClient, CloudEnvironment},
        credentials::{generate_resource_group_name, Credentials, RESOURCE_GROUP_PREFIX},
    },
    error::{Error, Result},
};
use maplit::btreemap;
use std::time::Duration;
use tracing::info;

const CREATED_BY_TAG: &str = "createdBy";
const CREATED_BY_VALUE: &str = "snapshot-e2e";

impl CloudClient {
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        let environment: CloudEnvironment = credentials.cloud.parse()?;

        Ok(Self::new(
            environment,
            &credentials.subscription_id,
            &credentials.aad_client_id,
            &credentials.tenant_id,
            &credentials.aad_client_secret,
        ))
    }
}

/// Only groups carrying the harness prefix may be deleted.
pub fn ensure_disposable(name: &str) -> Result<()> {
    if name.starts_with(RESOURCE_GROUP_PREFIX) {
        Ok(())
    } else {
        Err(Error::ForeignResourceGroup(name.to_owned()))
    }
}

/// A resource group created for the run to hold snapshots outside the
/// cluster's own group.
#[derive(Clone)]
pub struct ExternalResourceGroup {
    client: CloudClient,
    name: String,
}

impl ExternalResourceGroup {
    pub async fn create(client: CloudClient, location: &str) -> Result<Self> {
        let name = generate_resource_group_name();
        let tags = btreemap! {
            CREATED_BY_TAG.to_owned() => CREATED_BY_VALUE.to_owned(),
        };

        info!(name = %name, location, "creating external resource group");
        client
            .ensure_resource_group(&name, location, Some(&tags))
            .await?;

        Ok(Self { client, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn delete(&self, timeout: Duration) -> Result<()> {
        ensure_disposable(&self.name)?;

        info!(name = %self.name, "deleting external resource group");
        self.client
            .delete_resource_group(&self.name, timeout)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn credentials(cloud: &str) -> Credentials {
        Credentials::builder()
            .cloud(cloud.to_string())
            .tenant_id("tenant".to_string())
            .subscription_id("subscription".to_string())
            .aad_client_id("client".to_string())
            .aad_client_secret("secret".to_string())
            .build()
    }

    #[test]
    fn test_generated_names_are_disposable() {
        assert!(ensure_disposable(&generate_resource_group_name()).is_ok());
    }

    #[test]
    fn test_foreign_names_are_refused() {
        let result = ensure_disposable("production-rg");

        assert!(matches!(
            result,
            Err(Error::ForeignResourceGroup(ref name)) if name == "production-rg"
        ));
    }

    #[test]
    fn test_prefix_must_lead() {
        assert!(ensure_disposable("my-azuredisk-csi-driver-test-1234").is_err());
    }

    #[test]
    fn test_client_from_credentials() {
        assert!(CloudClient::from_credentials(&credentials("AzureChinaCloud")).is_ok());
    }

    #[test]
    fn test_client_from_credentials_unknown_cloud() {
        let result = CloudClient::from_credentials(&credentials("AzureMoonCloud"));

        assert_eq!(
            result.err().map(|e| e.to_string()),
            Some("unknown cloud environment: AzureMoonCloud".to_string())
        );
    }
}
