//! 双向字节中继
//!
//! 桥接后，每个方向都由 [`pump`] 驱动：先冲刷目标端的积压数据，再从源端读取直到
//! WouldBlock，并以非阻塞方式写入目标端。目标端写不完的部分追加到积压缓冲区，
//! 同时暂停读取源端，直到目标端再次可写。每个已读字节要么被写出，要么进入积压，
//! 不会两者兼有，也不会丢失。TLS 端点内部排队的记录同样视为积压。

use std::io::{self, Read, Write};

use super::session::TlsSession;
use crate::io_util::{recv, send, ReadOutcome, WriteOutcome};

/// 中继端点：明文 socket 或 TLS 会话
pub trait Endpoint {
    /// 读取一次
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome;

    /// 写入一次
    fn write(&mut self, buf: &[u8]) -> WriteOutcome;

    /// 冲刷端点内部排队的数据；暂时不可写不算错误
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// 端点内部是否还有未送出的数据
    fn is_drained(&self) -> bool {
        true
    }
}

/// 明文端点
pub struct PlainEndpoint<'a, S> {
    stream: &'a mut S,
}

impl<'a, S: Read + Write> PlainEndpoint<'a, S> {
    pub fn new(stream: &'a mut S) -> Self {
        Self { stream }
    }
}

impl<S: Read + Write> Endpoint for PlainEndpoint<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        recv(self.stream, buf)
    }

    fn write(&mut self, buf: &[u8]) -> WriteOutcome {
        send(self.stream, buf)
    }
}

/// TLS 端点：明文经会话加密后写入客户端 socket
pub struct TlsEndpoint<'a, S> {
    session: &'a mut TlsSession,
    stream: &'a mut S,
}

impl<'a, S: Read + Write> TlsEndpoint<'a, S> {
    pub fn new(session: &'a mut TlsSession, stream: &'a mut S) -> Self {
        Self { session, stream }
    }
}

impl<S: Read + Write> Endpoint for TlsEndpoint<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        self.session.read(self.stream, buf)
    }

    fn write(&mut self, buf: &[u8]) -> WriteOutcome {
        self.session.write(self.stream, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.session.flush(self.stream).map(|_| ())
    }

    fn is_drained(&self) -> bool {
        !self.session.wants_write()
    }
}

/// 单方向中继的结果
#[derive(Debug)]
pub enum RelayOutcome {
    /// 有进展或需要等待，连接保持打开
    Open,
    /// 源端正常关闭
    PeerClosed,
    /// 不可恢复的错误
    Failed(io::Error),
}

/// 一次 pump 的结果和转发字节数
#[derive(Debug)]
pub struct Pump {
    pub outcome: RelayOutcome,
    pub forwarded: u64,
}

impl Pump {
    fn new(outcome: RelayOutcome, forwarded: u64) -> Self {
        Self { outcome, forwarded }
    }
}

/// 从 `src` 向 `dst` 搬运数据
pub fn pump<R, W>(src: &mut R, dst: &mut W, pending: &mut Vec<u8>, scratch: &mut [u8]) -> Pump
where
    R: Endpoint + ?Sized,
    W: Endpoint + ?Sized,
{
    let mut forwarded = 0u64;

    if let Err(e) = dst.flush() {
        return Pump::new(RelayOutcome::Failed(e), forwarded);
    }
    if !dst.is_drained() {
        return Pump::new(RelayOutcome::Open, forwarded);
    }

    if !pending.is_empty() {
        match forward(dst, pending) {
            Ok(n) => {
                pending.drain(..n);
                forwarded += n as u64;
            }
            Err(e) => return Pump::new(RelayOutcome::Failed(e), forwarded),
        }
        if !pending.is_empty() {
            // 目标端仍然拥塞，暂停读取源端
            return Pump::new(RelayOutcome::Open, forwarded);
        }
    }

    loop {
        match src.read(scratch) {
            ReadOutcome::Data(n) => {
                let chunk = &scratch[..n];
                match forward(dst, chunk) {
                    Ok(m) => {
                        forwarded += m as u64;
                        if m < n {
                            pending.extend_from_slice(&chunk[m..]);
                            return Pump::new(RelayOutcome::Open, forwarded);
                        }
                        // 源端的关闭只在目标端全部送出后才处理
                        if !dst.is_drained() {
                            return Pump::new(RelayOutcome::Open, forwarded);
                        }
                    }
                    Err(e) => return Pump::new(RelayOutcome::Failed(e), forwarded),
                }
            }
            ReadOutcome::WouldBlock => return Pump::new(RelayOutcome::Open, forwarded),
            ReadOutcome::Closed => return Pump::new(RelayOutcome::PeerClosed, forwarded),
            ReadOutcome::Failed(e) => return Pump::new(RelayOutcome::Failed(e), forwarded),
        }
    }
}

/// 尽量写出 `data`，返回写出的字节数
fn forward<W: Endpoint + ?Sized>(dst: &mut W, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match dst.write(&data[written..]) {
            WriteOutcome::Data(n) => written += n,
            WriteOutcome::WouldBlock => break,
            WriteOutcome::Failed(e) => return Err(e),
        }
    }
    Ok(written)
}
