pub mod access_log;
pub mod body;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod responder;
pub mod server;
pub mod storage;
pub mod upstream;

pub use error::ProxyError;
pub use server::Server;
