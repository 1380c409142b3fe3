pub mod config;
pub mod connection;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;

pub use config::ServerConfig;
pub use metrics::Metrics;
pub use server::Server;
pub use service::LockService;
