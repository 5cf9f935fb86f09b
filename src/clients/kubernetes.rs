use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use k8s_openapi::serde::{de::DeserializeOwned, Serialize};
use kube::{
    api::{Api, PostParams},
    core::{ClusterResourceScope, NamespaceResourceScope, Resource},
    Client, Config, ResourceExt,
};
use std::{fmt::Debug, future::Future, time::Duration};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load KUBECONFIG: {0}")]
    Infer(#[from] kube::config::InferConfigError),

    #[error("API request failed: {0}")]
    Api(#[from] kube::Error),

    #[error("{kind} {name} still exists")]
    StillPresent { kind: String, name: String },
}

pub async fn new_client() -> Result<Client, Error> {
    let config = Config::infer().await?;
    Ok(Client::try_from(config)?)
}

/// Backoff used for every "wait until" style check: starts at two seconds,
/// caps at ten, and gives up once `timeout` has elapsed.
pub fn polling_backoff(timeout: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(2))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(timeout))
        .build()
}

/// Polls `operation` until it succeeds, fails permanently, or `timeout`
/// elapses.  On timeout the last transient error is returned.
pub async fn poll_until<T, E, F, Fut>(timeout: Duration, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, backoff::Error<E>>>,
{
    retry(polling_backoff(timeout), operation).await
}

pub trait ClientHelpers {
    async fn create_resource<T>(&self, api: Api<T>, resource: &T) -> Result<T, Error>
    where
        T: Resource + Clone + Debug + DeserializeOwned + Serialize;

    async fn create_cluster_resource<T>(&self, resource: &T) -> Result<T, Error>
    where
        T: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize;

    async fn create_namespaced_resource<T>(&self, namespace: &str, resource: &T) -> Result<T, Error>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize;

    async fn delete_resource<T>(&self, api: &Api<T>, name: &str) -> Result<(), Error>
    where
        T: Resource + Clone + Debug + DeserializeOwned;

    async fn wait_for_deletion<T>(
        &self,
        api: &Api<T>,
        name: &str,
        timeout: Duration,
    ) -> Result<(), Error>
    where
        T: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned;
}

impl ClientHelpers for Client {
    async fn create_resource<T>(&self, api: Api<T>, resource: &T) -> Result<T, Error>
    where
        T: Resource + Clone + Debug + DeserializeOwned + Serialize,
    {
        let created = api.create(&PostParams::default(), resource).await?;
        debug!(name = %created.name_any(), "created resource");

        Ok(created)
    }

    async fn create_cluster_resource<T>(&self, resource: &T) -> Result<T, Error>
    where
        T: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let api: Api<T> = Api::all(self.clone());
        self.create_resource(api, resource).await
    }

    async fn create_namespaced_resource<T>(&self, namespace: &str, resource: &T) -> Result<T, Error>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let api: Api<T> = Api::namespaced(self.clone(), namespace);
        self.create_resource(api, resource).await
    }

    async fn delete_resource<T>(&self, api: &Api<T>, name: &str) -> Result<(), Error>
    where
        T: Resource + Clone + Debug + DeserializeOwned,
    {
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ref err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e)?,
        }
    }

    async fn wait_for_deletion<T>(
        &self,
        api: &Api<T>,
        name: &str,
        timeout: Duration,
    ) -> Result<(), Error>
    where
        T: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
    {
        poll_until(timeout, || async {
            match api.get_opt(name).await {
                Ok(None) => Ok(()),
                Ok(Some(_)) => Err(backoff::Error::transient(Error::StillPresent {
                    kind: T::kind(&()).to_string(),
                    name: name.to_string(),
                })),
                Err(e) => Err(retry_error(e)),
            }
        })
        .await
    }
}

pub fn retry_error<E: From<kube::Error>>(error: kube::Error) -> backoff::Error<E> {
    if is_retryable(&error) {
        backoff::Error::transient(error.into())
    } else {
        backoff::Error::permanent(error.into())
    }
}

/// 4xx responses are final, except 404, 409 and 429.
pub fn is_retryable(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(err) => !(400..500).contains(&err.code) || matches!(err.code, 404 | 409 | 429),
        _ => true,
    }
}
