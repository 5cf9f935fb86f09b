pub mod azure;
pub mod credentials;
pub mod kubernetes;
