pub mod cleanup;
pub mod clients;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod namespace;
pub mod pod;
pub mod pvc;
pub mod quantity;
pub mod resource_group;
pub mod scenario;
pub mod snapshot;
