use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{validator::ConfigValidator, ProxyConfig, ProxyMode};

/// ProxyConfig Builder
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    listen_addr: Option<String>,
    listen_port: Option<u16>,
    backend_addr: Option<String>,
    backend_port: Option<u16>,
    mode: Option<ProxyMode>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    strict_protocol: bool,
    handshake_timeout_secs: Option<u64>,
    backlog: Option<u32>,
    max_events: Option<usize>,
    tcp_nodelay: Option<bool>,
}

impl ProxyConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听地址
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// 设置监听端口
    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// 设置后端地址
    pub fn backend_addr(mut self, addr: impl Into<String>) -> Self {
        self.backend_addr = Some(addr.into());
        self
    }

    /// 设置后端端口
    pub fn backend_port(mut self, port: u16) -> Self {
        self.backend_port = Some(port);
        self
    }

    /// 设置工作模式
    pub fn mode(mut self, mode: ProxyMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// 设置证书路径
    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(path.into());
        self
    }

    /// 设置私钥路径
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// 设置是否严格校验协议
    pub fn strict_protocol(mut self, strict: bool) -> Self {
        self.strict_protocol = strict;
        self
    }

    /// 设置握手超时（秒）
    pub fn handshake_timeout_secs(mut self, secs: u64) -> Self {
        self.handshake_timeout_secs = Some(secs);
        self
    }

    /// 设置 listen backlog
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// 设置单次 poll 的事件容量
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = Some(max_events);
        self
    }

    /// 设置 TCP_NODELAY
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = Some(nodelay);
        self
    }

    /// 构建 ProxyConfig 并验证
    pub fn build(self) -> Result<ProxyConfig> {
        let config = ProxyConfig {
            listen_addr: self.listen_addr.unwrap_or_else(super::default_listen_addr),
            listen_port: self.listen_port.context("listen_port is required")?,
            backend_addr: self.backend_addr.unwrap_or_else(super::default_backend_addr),
            backend_port: self.backend_port.context("backend_port is required")?,
            mode: self.mode.unwrap_or_default(),
            cert_path: self.cert_path,
            key_path: self.key_path,
            strict_protocol: self.strict_protocol,
            handshake_timeout_secs: self.handshake_timeout_secs,
            backlog: self.backlog.unwrap_or_else(super::default_backlog),
            max_events: self.max_events.unwrap_or_else(super::default_max_events),
            tcp_nodelay: self.tcp_nodelay.unwrap_or(true),
        };

        // 验证配置
        ConfigValidator::validate_proxy_config(&config)?;

        Ok(config)
    }
}
