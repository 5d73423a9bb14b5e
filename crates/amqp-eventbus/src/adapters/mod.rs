//! Adapters: concrete transports and configuration loading.

pub mod config_file;
pub mod tcp;
pub mod tls;

pub use config_file::{load_tls_material, ConfigFile};
pub use tcp::TcpConnector;
pub use tls::{TlsAdaptor, TlsMaterial};
