use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;
use typed_builder::TypedBuilder;

pub const RESOURCE_GROUP_PREFIX: &str = "azuredisk-csi-driver-test-";
pub const TEMP_CREDENTIAL_FILE_PATH: &str = "/tmp/azure.json";

const DEFAULT_CLOUD: &str = "AzurePublicCloud";
const DEFAULT_LOCATION: &str = "eastus2";
const DEFAULT_VM_TYPE: &str = "vmss";

const CLOUD_NAME_ENV_VAR: &str = "AZURE_CLOUD_NAME";
const TENANT_ID_ENV_VAR: &str = "AZURE_TENANT_ID";
const SUBSCRIPTION_ID_ENV_VAR: &str = "AZURE_SUBSCRIPTION_ID";
const AAD_CLIENT_ID_ENV_VAR: &str = "AZURE_CLIENT_ID";
const AAD_CLIENT_SECRET_ENV_VAR: &str = "AZURE_CLIENT_SECRET";
const RESOURCE_GROUP_ENV_VAR: &str = "AZURE_RESOURCE_GROUP";
const LOCATION_ENV_VAR: &str = "AZURE_LOCATION";
const VM_TYPE_ENV_VAR: &str = "AZURE_VM_TYPE";

#[derive(Debug, Error)]
pub enum Error {
    #[error("environment variable {0} is not set")]
    MissingEnvVar(&'static str),

    #[error("failed to write credential file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to delete credential file {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize credentials: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Service principal and placement details of the cluster under test, in
/// the layout the cloud provider expects for its `azure.json` file.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[builder(default = DEFAULT_CLOUD.to_owned())]
    pub cloud: String,

    pub tenant_id: String,
    pub subscription_id: String,
    pub aad_client_id: String,
    pub aad_client_secret: String,

    #[builder(default = generate_resource_group_name())]
    pub resource_group: String,

    #[builder(default = DEFAULT_LOCATION.to_owned())]
    pub location: String,

    #[builder(default = DEFAULT_VM_TYPE.to_owned())]
    pub vm_type: String,
}

pub fn generate_resource_group_name() -> String {
    format!("{}{}", RESOURCE_GROUP_PREFIX, uuid::Uuid::new_v4())
}

impl Credentials {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds credentials from a variable lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let required =
            |key: &'static str| optional(key).ok_or(Error::MissingEnvVar(key));

        Ok(Self {
            cloud: optional(CLOUD_NAME_ENV_VAR).unwrap_or_else(|| DEFAULT_CLOUD.to_owned()),
            tenant_id: required(TENANT_ID_ENV_VAR)?,
            subscription_id: required(SUBSCRIPTION_ID_ENV_VAR)?,
            aad_client_id: required(AAD_CLIENT_ID_ENV_VAR)?,
            aad_client_secret: required(AAD_CLIENT_SECRET_ENV_VAR)?,
            resource_group: optional(RESOURCE_GROUP_ENV_VAR)
                .unwrap_or_else(generate_resource_group_name),
            location: optional(LOCATION_ENV_VAR).unwrap_or_else(|| DEFAULT_LOCATION.to_owned()),
            vm_type: optional(VM_TYPE_ENV_VAR).unwrap_or_else(|| DEFAULT_VM_TYPE.to_owned()),
        })
    }
}

/// The on-disk credential file; lives from `create` until `delete`.
#[derive(Clone, Debug)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the credentials from the environment and writes them out.
    pub async fn create(&self) -> Result<Credentials, Error> {
        let credentials = Credentials::from_env()?;
        self.write(&credentials).await?;

        Ok(credentials)
    }

    pub async fn write(&self, credentials: &Credentials) -> Result<(), Error> {
        let contents = serde_json::to_vec_pretty(credentials)?;
        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|source| Error::Write {
                path: self.path.clone(),
                source,
            })?;

        info!(path = %self.path.display(), "wrote credential file");
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Delete {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Default for CredentialFile {
    fn default() -> Self {
        Self::new(TEMP_CREDENTIAL_FILE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(vars: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |key| vars.get(key).map(|value| value.to_string())
    }

    #[test]
    fn test_from_lookup_with_defaults() {
        let credentials = Credentials::from_lookup(lookup_from(hashmap! {
            "AZURE_TENANT_ID" => "tenant",
            "AZURE_SUBSCRIPTION_ID" => "subscription",
            "AZURE_CLIENT_ID" => "client",
            "AZURE_CLIENT_SECRET" => "secret",
        }))
        .expect("failed to build credentials");

        assert_eq!(credentials.cloud, "AzurePublicCloud");
        assert_eq!(credentials.location, "eastus2");
        assert_eq!(credentials.vm_type, "vmss");
        assert!(credentials.resource_group.starts_with(RESOURCE_GROUP_PREFIX));
    }

    #[test]
    fn test_from_lookup_with_overrides() {
        let credentials = Credentials::from_lookup(lookup_from(hashmap! {
            "AZURE_CLOUD_NAME" => "AzureChinaCloud",
            "AZURE_TENANT_ID" => "tenant",
            "AZURE_SUBSCRIPTION_ID" => "subscription",
            "AZURE_CLIENT_ID" => "client",
            "AZURE_CLIENT_SECRET" => "secret",
            "AZURE_RESOURCE_GROUP" => "my-rg",
            "AZURE_LOCATION" => "chinaeast2",
            "AZURE_VM_TYPE" => "standard",
        }))
        .expect("failed to build credentials");

        assert_eq!(
            credentials,
            Credentials::builder()
                .cloud("AzureChinaCloud".into())
                .tenant_id("tenant".into())
                .subscription_id("subscription".into())
                .aad_client_id("client".into())
                .aad_client_secret("secret".into())
                .resource_group("my-rg".into())
                .location("chinaeast2".into())
                .vm_type("standard".into())
                .build()
        );
    }

    #[test]
    fn test_from_lookup_missing_secret() {
        let err = Credentials::from_lookup(lookup_from(hashmap! {
            "AZURE_TENANT_ID" => "tenant",
            "AZURE_SUBSCRIPTION_ID" => "subscription",
            "AZURE_CLIENT_ID" => "client",
            "AZURE_CLIENT_SECRET" => "",
        }))
        .unwrap_err();

        assert!(matches!(err, Error::MissingEnvVar("AZURE_CLIENT_SECRET")));
    }

    #[test]
    fn test_serialized_field_names() {
        let credentials = Credentials::builder()
            .tenant_id("tenant".into())
            .subscription_id("subscription".into())
            .aad_client_id("client".into())
            .aad_client_secret("secret".into())
            .resource_group("rg".into())
            .build();

        assert_eq!(
            serde_json::to_value(&credentials).unwrap(),
            serde_json::json!({
                "cloud": "AzurePublicCloud",
                "tenantId": "tenant",
                "subscriptionId": "subscription",
                "aadClientId": "client",
                "aadClientSecret": "secret",
                "resourceGroup": "rg",
                "location": "eastus2",
                "vmType": "vmss",
            })
        );
    }

    #[tokio::test]
    async fn test_credential_file_write_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let file = CredentialFile::new(dir.path().join("azure.json"));
        let credentials = Credentials::builder()
            .tenant_id("tenant".into())
            .subscription_id("subscription".into())
            .aad_client_id("client".into())
            .aad_client_secret("secret".into())
            .build();

        file.write(&credentials).await.unwrap();

        let written: Credentials =
            serde_json::from_slice(&std::fs::read(file.path()).unwrap()).unwrap();
        assert_eq!(written, credentials);

        file.delete().await.unwrap();
        assert!(!file.path().exists());

        // Deleting twice is fine.
        file.delete().await.unwrap();
    }
}
