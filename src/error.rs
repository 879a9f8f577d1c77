/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型；启动阶段的错误通过 anyhow 携带上下文，
/// 单连接范围内的错误用 ProxyError 表达，只终止对应连接
use std::io;
use thiserror::Error;

use crate::config::ProxyMode;
use crate::proxy::Protocol;

/// 代理的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 监听失败
    #[error("Failed to listen on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 后端连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS 握手失败
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// 客户端协议与代理模式不一致
    #[error("Protocol mismatch: {client} client against {mode} proxy")]
    ProtocolMismatch { client: Protocol, mode: ProxyMode },

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// TLS 配置错误
    #[error("TLS error: {0}")]
    TlsError(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建监听失败错误
    pub fn bind_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::BindFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建握手失败错误
    pub fn handshake_failed(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    /// 创建协议不匹配错误
    pub fn protocol_mismatch(client: Protocol, mode: ProxyMode) -> Self {
        Self::ProtocolMismatch { client, mode }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为协议不匹配
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(self, Self::ProtocolMismatch { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}
