pub mod cluster_request;
pub mod cluster_resource;
pub mod inventory;
pub mod kubeconfig;
pub mod node;
pub mod platform_auth;
pub mod platform_connection;
pub mod vm;
