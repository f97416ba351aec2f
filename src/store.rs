//! Object-store abstraction over the Kubernetes API
//!
//! All reads and writes of ingresses, secrets, and RenewalPolicy records go
//! through the [`ObjectStore`] trait. This allows mocking the Kubernetes
//! client in tests while using the real client in production.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::crd::{RenewalPolicy, RenewalPolicyStatus};
use crate::{ingress, Error, DEFAULT_POLICY_NAME, ENABLED_LABEL, FIELD_MANAGER};

/// A change observed on a watched ingress
#[derive(Clone, Debug)]
pub enum IngressEvent {
    /// The ingress was created or updated
    Modified(Ingress),
    /// The ingress was deleted
    Deleted(Ingress),
}

/// Stream of ingress changes
pub type IngressEvents = BoxStream<'static, Result<IngressEvent, Error>>;

/// Kubernetes reads and writes used by the audit and renewal paths
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a single ingress, erroring if it does not exist
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, Error>;

    /// List all ingresses across the cluster with a truthy enablement label
    async fn list_enabled_ingresses(&self) -> Result<Vec<Ingress>, Error>;

    /// Write back a modified ingress
    ///
    /// Uses replace semantics so a stale resource version is rejected by the
    /// API server instead of silently clobbering a concurrent write.
    async fn update_ingress(&self, ingress: &Ingress) -> Result<(), Error>;

    /// Watch a single ingress for changes
    fn watch_ingress(&self, namespace: &str, name: &str) -> IngressEvents;

    /// Watch all ingresses carrying the enablement label
    fn watch_enabled_ingresses(&self) -> IngressEvents;

    /// Fetch a secret, erroring if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error>;

    /// Delete a secret; deleting an already-gone secret is not an error
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch the namespace's default RenewalPolicy, if one exists
    async fn get_policy(&self, namespace: &str) -> Result<Option<RenewalPolicy>, Error>;

    /// Create a RenewalPolicy in its target namespace
    async fn create_policy(&self, policy: &RenewalPolicy) -> Result<(), Error>;

    /// Patch the status subresource of the namespace's default RenewalPolicy
    async fn update_policy_status(
        &self,
        namespace: &str,
        status: &RenewalPolicyStatus,
    ) -> Result<(), Error>;
}

/// [`ObjectStore`] backed by a real Kubernetes client
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn map_get_error(err: kube::Error, what: String) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(what),
        other => Error::Kube(other),
    }
}

fn map_watch_events(
    event: Result<Event<Ingress>, watcher::Error>,
) -> Option<Result<IngressEvent, Error>> {
    match event {
        Ok(Event::Apply(ing)) | Ok(Event::InitApply(ing)) => {
            Some(Ok(IngressEvent::Modified(ing)))
        }
        Ok(Event::Delete(ing)) => Some(Ok(IngressEvent::Deleted(ing))),
        // Restart markers carry no object
        Ok(Event::Init) | Ok(Event::InitDone) => None,
        Err(e) => Some(Err(Error::watch(e.to_string()))),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_get_error(e, format!("ingress {}/{}", namespace, name)))
    }

    async fn list_enabled_ingresses(&self) -> Result<Vec<Ingress>, Error> {
        let api: Api<Ingress> = Api::all(self.client.clone());
        // Existence selector; truthiness of the value is checked client-side
        let params = ListParams::default().labels(ENABLED_LABEL);
        let list = api.list(&params).await?;
        Ok(list.items.into_iter().filter(ingress::is_enabled).collect())
    }

    async fn update_ingress(&self, ing: &Ingress) -> Result<(), Error> {
        let namespace = ing.namespace().unwrap_or_default();
        let name = ing.name_any();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), ing).await?;
        Ok(())
    }

    fn watch_ingress(&self, namespace: &str, name: &str) -> IngressEvents {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        watcher::watcher(api, config)
            .filter_map(|event| async move { map_watch_events(event) })
            .boxed()
    }

    fn watch_enabled_ingresses(&self) -> IngressEvents {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let config = watcher::Config::default().labels(ENABLED_LABEL);
        watcher::watcher(api, config)
            .filter_map(|event| async move { map_watch_events(event) })
            .boxed()
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_get_error(e, format!("secret {}/{}", namespace, name)))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn get_policy(&self, namespace: &str) -> Result<Option<RenewalPolicy>, Error> {
        let api: Api<RenewalPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(DEFAULT_POLICY_NAME).await?)
    }

    async fn create_policy(&self, policy: &RenewalPolicy) -> Result<(), Error> {
        let namespace = &policy.spec.target_namespace;
        let api: Api<RenewalPolicy> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), policy).await?;
        Ok(())
    }

    async fn update_policy_status(
        &self,
        namespace: &str,
        status: &RenewalPolicyStatus,
    ) -> Result<(), Error> {
        let api: Api<RenewalPolicy> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            DEFAULT_POLICY_NAME,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}
