//! 协议嗅探：窥视首字节判断客户端是 TLS 还是明文，不消耗数据

use serde::{Deserialize, Serialize};
use std::io;

use mio::net::TcpStream;

use crate::config::ProxyMode;
use crate::io_util::is_would_block;

/// TLS 握手记录的 content type
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// 客户端协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Plain,
    Tls,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Plain => write!(f, "plain"),
            Protocol::Tls => write!(f, "tls"),
        }
    }
}

/// 根据首字节分类
pub fn classify(first: u8) -> Protocol {
    if first == TLS_HANDSHAKE_RECORD {
        Protocol::Tls
    } else {
        Protocol::Plain
    }
}

/// 协议检查结果
#[derive(Debug)]
pub enum Alignment {
    /// 客户端协议与模式一致
    Matched(Protocol),
    /// TLS 客户端连到了明文代理
    ProtocolMismatchPlain,
    /// 明文客户端连到了 TLS 代理
    ProtocolMismatchTls,
    /// 客户端在发送任何数据之前关闭
    PeerClosed,
    /// 还没有可窥视的数据，等待下一次可读通知
    Indeterminate,
    /// socket 错误
    Failed(io::Error),
}

/// 判断检测到的协议是否被当前模式接受
pub fn align(protocol: Protocol, mode: ProxyMode) -> Alignment {
    match (protocol, mode) {
        (Protocol::Tls, ProxyMode::Plain) => Alignment::ProtocolMismatchPlain,
        (Protocol::Plain, ProxyMode::Tls) => Alignment::ProtocolMismatchTls,
        (protocol, _) => Alignment::Matched(protocol),
    }
}

/// 窥视客户端首字节并与模式比对
pub fn check_protocol(stream: &TcpStream, mode: ProxyMode) -> Alignment {
    let mut byte = [0u8; 1];
    align_peeked(stream.peek(&mut byte), byte[0], mode)
}

fn align_peeked(peeked: io::Result<usize>, byte: u8, mode: ProxyMode) -> Alignment {
    match peeked {
        Ok(0) => Alignment::PeerClosed,
        Ok(_) => align(classify(byte), mode),
        Err(e) if is_would_block(&e) || e.kind() == io::ErrorKind::Interrupted => {
            Alignment::Indeterminate
        }
        Err(e) => Alignment::Failed(e),
    }
}
