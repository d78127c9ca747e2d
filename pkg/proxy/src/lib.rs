pub mod affinity;
pub mod config;
pub mod datapath;
pub mod error;
pub mod executor;
pub mod flows;
pub mod group;
pub mod reconciler;
pub mod registers;
pub mod retry;
pub mod service_proxy;
pub mod table;

pub use config::ProxyConfig;
pub use executor::{FlowExecutor, MemoryBridge};
pub use service_proxy::ServiceProxy;
