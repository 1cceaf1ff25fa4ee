/// Blockchain daemon access: capability trait, JSON-RPC client and the
/// per-session block template monitor.

pub mod daemon;
pub mod rpc_client;
pub mod template_manager;

pub use daemon::{BlockTemplate, Daemon, DaemonConnector, DaemonHandle, DaemonInfo, DaemonSettings};
pub use rpc_client::{RpcClient, RpcConnector};
pub use template_manager::TemplateMonitor;
