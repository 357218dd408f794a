//! ambassador-ingress-operator: converges Ambassador Mappings from Knative
//! ClusterIngress resources

pub mod clusteringress;
pub mod config;
pub mod controllers;
pub mod drift;
pub mod error;
pub mod health;
pub mod leader;
pub mod resources;
pub mod route;
pub mod store;

pub use clusteringress::ClusterIngress;
pub use config::OperatorConfig;
pub use error::ReconcileError;
