// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::ProxyConfigBuilder;
pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// 代理工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// 只接受明文客户端
    #[default]
    Plain,
    /// 只接受 TLS 客户端，在代理处终止 TLS
    Tls,
    /// 根据首字节自动识别明文或 TLS
    Auto,
}

impl ProxyMode {
    /// 该模式是否可能需要 TLS 证书
    pub fn needs_tls(self) -> bool {
        !matches!(self, ProxyMode::Plain)
    }
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Plain => write!(f, "plain"),
            ProxyMode::Tls => write!(f, "tls"),
            ProxyMode::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for ProxyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "tcp" => Ok(Self::Plain),
            "tls" | "ssl" => Ok(Self::Tls),
            "auto" => Ok(Self::Auto),
            _ => anyhow::bail!("Unknown proxy mode: {}", s),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_backend_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_backlog() -> u32 {
    128
}

fn default_max_events() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

/// 代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 代理监听地址（默认 0.0.0.0）
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// 代理监听端口
    #[serde(alias = "proxy_listen_port")]
    pub listen_port: u16,
    /// 后端地址（默认 127.0.0.1）
    #[serde(default = "default_backend_addr")]
    pub backend_addr: String,
    /// 后端端口
    pub backend_port: u16,
    /// 工作模式
    #[serde(default)]
    pub mode: ProxyMode,
    /// TLS 证书路径
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// plain/tls 模式下也先嗅探首字节，拒绝协议不匹配的客户端
    #[serde(default)]
    pub strict_protocol: bool,
    /// 未完成桥接的连接最长存活时间（秒），不设置则永不回收
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
    /// listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// 单次 poll 最多处理的事件数
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// 是否对客户端和后端连接启用 TCP_NODELAY
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
}

impl ProxyConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_proxy_config(self)
    }

    /// 监听地址
    pub fn listen_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        resolve(&self.listen_addr, self.listen_port)
    }

    /// 后端地址
    pub fn backend_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        resolve(&self.backend_addr, self.backend_port)
    }

    /// 握手超时
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    /// 当前配置是否需要加载 TLS 证书
    pub fn tls_enabled(&self) -> bool {
        self.mode.needs_tls()
    }

    /// 从文件加载代理配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        Self::from_toml(&content)
    }

    /// 从 TOML 文本解析代理配置（`[proxy]` 表）
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct ProxyConfigWrapper {
            proxy: ProxyConfig,
        }

        let wrapper: ProxyConfigWrapper =
            toml::from_str(content).context("Failed to parse proxy configuration")?;
        wrapper
            .proxy
            .validate()
            .context("Proxy configuration validation failed")?;
        Ok(wrapper.proxy)
    }
}

fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve address {}:{}", host, port))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("No address found for {}:{}", host, port))
}
