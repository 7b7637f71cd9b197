//! 远端数据网关模块

pub mod api;
#[cfg(test)]
pub mod memory;
pub mod profiles;
pub mod remote;

pub use api::{build_http_client, RestGateway};
pub use profiles::ProfileDirectory;
pub use remote::RemoteGateway;
