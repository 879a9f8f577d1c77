//! 服务端 TLS 会话适配层
//!
//! 包装 `rustls::ServerConnection`，把握手和加密读写映射为带标签的三态结果。
//! 会话不拥有 socket，每次调用都借用所属连接的客户端句柄；生命周期由连接管理。

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::io_util::{is_would_block, ReadOutcome, WriteOutcome};

/// 一次握手推进的结果
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// 握手完成
    Established,
    /// 需要等待下一次就绪通知后重试
    WouldBlock,
    /// 握手失败，会话不可再用
    Failed(io::Error),
}

/// 绑定到单个客户端连接的 TLS 会话
pub struct TlsSession {
    conn: rustls::ServerConnection,
}

impl TlsSession {
    /// 基于共享的服务器配置创建新会话
    pub fn new(config: Arc<rustls::ServerConfig>) -> io::Result<Self> {
        let conn = rustls::ServerConnection::new(config).map_err(tls_error)?;
        Ok(Self { conn })
    }

    /// 是否仍在握手
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// 是否有待发送的 TLS 记录
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// 推进一次非阻塞握手
    pub fn accept_step<S: Read + Write>(&mut self, sock: &mut S) -> HandshakeOutcome {
        loop {
            match self.flush(sock) {
                Ok(true) => {}
                Ok(false) => return HandshakeOutcome::WouldBlock,
                Err(e) => return HandshakeOutcome::Failed(e),
            }

            if !self.conn.is_handshaking() {
                return HandshakeOutcome::Established;
            }

            match self.conn.read_tls(sock) {
                Ok(0) => {
                    return HandshakeOutcome::Failed(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during handshake",
                    ))
                }
                Ok(_) => {}
                Err(e) if is_would_block(&e) => return HandshakeOutcome::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return HandshakeOutcome::Failed(e),
            }

            if let Err(e) = self.conn.process_new_packets() {
                // 尽力把 alert 发给对端
                let _ = self.conn.write_tls(sock);
                return HandshakeOutcome::Failed(tls_error(e));
            }
        }
    }

    /// 读取解密后的明文
    pub fn read<S: Read + Write>(&mut self, sock: &mut S, buf: &mut [u8]) -> ReadOutcome {
        let mut eof = false;
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => return ReadOutcome::Data(n),
                Err(e) if is_would_block(&e) => {}
                // 对端未发送 close_notify 就断开，按关闭处理
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return ReadOutcome::Closed,
                Err(e) => return ReadOutcome::Failed(e),
            }

            if eof {
                return ReadOutcome::Closed;
            }

            match self.conn.read_tls(sock) {
                Ok(0) => eof = true,
                Ok(_) => {}
                Err(e) if is_would_block(&e) => return ReadOutcome::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Failed(e),
            }

            if let Err(e) = self.conn.process_new_packets() {
                let _ = self.conn.write_tls(sock);
                return ReadOutcome::Failed(tls_error(e));
            }
        }
    }

    /// 加密并发送明文
    ///
    /// 返回被会话接收的明文字节数；已接收但尚未送出的记录留在会话内，
    /// 由后续 `flush` 在可写通知时发送
    pub fn write<S: Read + Write>(&mut self, sock: &mut S, buf: &[u8]) -> WriteOutcome {
        let accepted = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return WriteOutcome::Failed(e),
        };

        if let Err(e) = self.flush(sock) {
            return WriteOutcome::Failed(e);
        }

        if accepted == 0 {
            WriteOutcome::WouldBlock
        } else {
            WriteOutcome::Data(accepted)
        }
    }

    /// 发送排队中的 TLS 记录
    ///
    /// 返回 `Ok(true)` 表示已全部发出，`Ok(false)` 表示 socket 暂时不可写
    pub fn flush<S: Write>(&mut self, sock: &mut S) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(e) if is_would_block(&e) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// 发送 close_notify，尽力而为；握手未完成时不发送
    pub fn close<S: Write>(&mut self, sock: &mut S) {
        if !self.conn.is_handshaking() {
            self.conn.send_close_notify();
        }
        let _ = self.flush(sock);
    }
}

fn tls_error(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
