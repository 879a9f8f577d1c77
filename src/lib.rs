/// TLS Edge Proxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod error;
pub mod io_util;
pub mod net;
pub mod proxy;
pub mod stats;
pub mod tls;

// 重新导出常用类型
pub use config::{ProxyConfig, ProxyConfigBuilder, ProxyMode};
pub use error::{ProxyError, Result};
pub use proxy::{Protocol, Proxy, ShutdownHandle};
pub use stats::{ProxyStats, ProxyStatsTracker};
