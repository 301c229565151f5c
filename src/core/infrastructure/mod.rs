pub mod api_client;
pub mod artifact_cache;
pub(crate) mod atomic_file;
pub mod config_store;
pub mod inventory_store;
pub mod keypair;
pub mod platform;
pub mod remote;
pub mod state_layout;
pub mod trust_store;
