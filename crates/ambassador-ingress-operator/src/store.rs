//! Object store access
//!
//! The reconciler talks to the cluster only through [`ObjectStore`], so the
//! convergence logic can be exercised against mocks. [`KubeStore`] is the
//! production implementation on top of the Kubernetes API.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::clusteringress::ClusterIngress;
use crate::route::Route;

/// Store operations needed by the reconciler and the orphan sweep.
///
/// Writes carry the object's `resourceVersion`; the store rejects stale
/// writes with [`StoreError::Conflict`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_cluster_ingress(&self, name: &str) -> Result<ClusterIngress, StoreError>;

    async fn list_cluster_ingresses(&self) -> Result<Vec<ClusterIngress>, StoreError>;

    /// Write the status subresource, guarded by the object's resourceVersion
    async fn update_cluster_ingress_status(
        &self,
        ingress: &ClusterIngress,
    ) -> Result<ClusterIngress, StoreError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError>;

    async fn create_service(&self, service: &Service) -> Result<Service, StoreError>;

    async fn update_service(&self, service: &Service) -> Result<Service, StoreError>;

    async fn list_services(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Service>, StoreError>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn get_route(&self, namespace: &str, name: &str) -> Result<Route, StoreError>;

    async fn create_route(&self, route: &Route) -> Result<Route, StoreError>;

    async fn update_route(&self, route: &Route) -> Result<Route, StoreError>;

    /// List Routes across all namespaces
    async fn list_routes(&self, label_selector: &str) -> Result<Vec<Route>, StoreError>;

    async fn delete_route(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Check that the API server answers
    async fn check_readiness(&self) -> Result<bool, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("Conflict writing {kind} {name}: {message}")]
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
    },
    #[error("Object store request failed: {0}")]
    Backend(String),
}

impl StoreError {
    /// Classify a Kubernetes API error for the given object
    fn from_kube(kind: &'static str, name: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref ae) if ae.code == 404 => Self::NotFound {
                kind,
                name: name.into(),
            },
            kube::Error::Api(ref ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    kind,
                    name: name.into(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                kind,
                name: name.into(),
                message: ae.message,
            },
            other => Self::Backend(other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn qualified(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn object_namespace<K: ResourceExt>(obj: &K) -> Result<String, StoreError> {
    obj.namespace()
        .ok_or_else(|| StoreError::Backend(format!("{} has no namespace", obj.name_any())))
}

/// Kubernetes-backed store
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    #[instrument(skip(self))]
    async fn get_cluster_ingress(&self, name: &str) -> Result<ClusterIngress, StoreError> {
        let api: Api<ClusterIngress> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube("ClusterIngress", name, e))
    }

    #[instrument(skip(self))]
    async fn list_cluster_ingresses(&self) -> Result<Vec<ClusterIngress>, StoreError> {
        let api: Api<ClusterIngress> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::from_kube("ClusterIngress", "*", e))?;
        Ok(list.items)
    }

    #[instrument(skip(self, ingress), fields(name = %ingress.name_any()))]
    async fn update_cluster_ingress_status(
        &self,
        ingress: &ClusterIngress,
    ) -> Result<ClusterIngress, StoreError> {
        let name = ingress.name_any();
        let api: Api<ClusterIngress> = Api::all(self.client.clone());

        // Merge patch carrying resourceVersion is rejected with 409 when stale
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": ingress.resource_version(),
            },
            "status": ingress.status,
        });

        let updated = api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube("ClusterIngress", name.clone(), e))?;

        debug!(name = %name, "Updated ClusterIngress status");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube("Service", qualified(namespace, name), e))
    }

    #[instrument(skip(self, service), fields(name = %service.name_any()))]
    async fn create_service(&self, service: &Service) -> Result<Service, StoreError> {
        let namespace = object_namespace(service)?;
        let name = qualified(&namespace, &service.name_any());
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), service)
            .await
            .map_err(|e| StoreError::from_kube("Service", name, e))
    }

    #[instrument(skip(self, service), fields(name = %service.name_any()))]
    async fn update_service(&self, service: &Service) -> Result<Service, StoreError> {
        let namespace = object_namespace(service)?;
        let name = service.name_any();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), service)
            .await
            .map_err(|e| StoreError::from_kube("Service", qualified(&namespace, &name), e))
    }

    #[instrument(skip(self))]
    async fn list_services(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Service>, StoreError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| StoreError::from_kube("Service", qualified(namespace, "*"), e))?;
        Ok(list.items)
    }

    #[instrument(skip(self))]
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| StoreError::from_kube("Service", qualified(namespace, name), e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_route(&self, namespace: &str, name: &str) -> Result<Route, StoreError> {
        let api: Api<Route> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube("Route", qualified(namespace, name), e))
    }

    #[instrument(skip(self, route), fields(name = %route.name_any()))]
    async fn create_route(&self, route: &Route) -> Result<Route, StoreError> {
        let namespace = object_namespace(route)?;
        let name = qualified(&namespace, &route.name_any());
        let api: Api<Route> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), route)
            .await
            .map_err(|e| StoreError::from_kube("Route", name, e))
    }

    #[instrument(skip(self, route), fields(name = %route.name_any()))]
    async fn update_route(&self, route: &Route) -> Result<Route, StoreError> {
        let namespace = object_namespace(route)?;
        let name = route.name_any();
        let api: Api<Route> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), route)
            .await
            .map_err(|e| StoreError::from_kube("Route", qualified(&namespace, &name), e))
    }

    #[instrument(skip(self))]
    async fn list_routes(&self, label_selector: &str) -> Result<Vec<Route>, StoreError> {
        let api: Api<Route> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| StoreError::from_kube("Route", "*", e))?;
        Ok(list.items)
    }

    #[instrument(skip(self))]
    async fn delete_route(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<Route> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| StoreError::from_kube("Route", qualified(namespace, name), e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn check_readiness(&self) -> Result<bool, StoreError> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        debug!(version = %info.git_version, "API server readiness check: OK");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_classify_not_found() {
        let err = StoreError::from_kube("Service", "ambassador/hello", api_error(404, "NotFound"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Service ambassador/hello not found");
    }

    #[test]
    fn test_classify_already_exists() {
        let err = StoreError::from_kube("Service", "ambassador/hello", api_error(409, "AlreadyExists"));
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[test]
    fn test_classify_conflict() {
        let err = StoreError::from_kube("ClusterIngress", "hello", api_error(409, "Conflict"));
        match err {
            StoreError::Conflict { kind, name, message } => {
                assert_eq!(kind, "ClusterIngress");
                assert_eq!(name, "hello");
                assert_eq!(message, "Conflict happened");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_classify_other_api_errors_as_backend() {
        let err = StoreError::from_kube("Service", "ambassador/hello", api_error(500, "InternalError"));
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
