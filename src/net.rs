use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;

use crate::error::{ProxyError, Result};

/// 后端连接的建立进度
#[derive(Debug)]
pub enum ConnectProgress {
    /// 已连接
    Connected,
    /// 仍在进行中（伪唤醒）
    InProgress,
    /// 连接失败
    Failed(io::Error),
}

/// 创建非阻塞监听 socket
///
/// 失败对进程是致命的，由调用方终止启动
pub fn listen(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let bind_err = |e: io::Error| ProxyError::bind_failed(addr.to_string(), e);

    let socket =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket
        .listen(backlog.min(i32::MAX as u32) as i32)
        .map_err(bind_err)?;
    set_nonblocking(&socket).map_err(bind_err)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

/// 设置非阻塞模式
pub fn set_nonblocking<S>(socket: &S) -> io::Result<()>
where
    for<'s> SockRef<'s>: From<&'s S>,
{
    SockRef::from(socket).set_nonblocking(true)
}

/// 发起非阻塞连接
///
/// 返回时连接通常仍在进行中，这是正常结果；立即失败的 socket 会被丢弃并返回错误
pub fn connect_nonblocking(addr: SocketAddr) -> Result<TcpStream> {
    TcpStream::connect(addr).map_err(|e| ProxyError::connection_failed(addr.to_string(), e))
}

/// 在可写通知到达后检查连接结果（SO_ERROR）
pub fn connect_progress(stream: &TcpStream) -> ConnectProgress {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return ConnectProgress::Failed(e),
        Ok(None) => {}
    }

    match stream.peer_addr() {
        Ok(_) => ConnectProgress::Connected,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectProgress::InProgress,
        Err(e) => ConnectProgress::Failed(e),
    }
}
