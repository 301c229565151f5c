pub mod bootstrap_service;
pub mod lifecycle_service;
pub mod provision_service;
