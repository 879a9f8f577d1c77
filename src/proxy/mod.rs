//! 连接引擎
//!
//! 单线程 `mio` 反应器：监听 socket 就绪时接入新连接，连接句柄就绪时通过注册表
//! 找到连接并交给状态机处理；状态机要求关闭时统一走 [`Proxy::teardown`]。

mod connection;
mod reaper;
mod registry;
mod relay;
mod session;
mod sniff;

pub use connection::{CloseReason, ConnState, EngineSettings, Readiness};
pub use reaper::HandshakeReaper;
pub use registry::{ConnId, ConnectionRegistry, Side, TokenAllocator};
pub use relay::{pump, Endpoint, PlainEndpoint, Pump, RelayOutcome, TlsEndpoint};
pub use session::{HandshakeOutcome, TlsSession};
pub use sniff::{align, check_protocol, classify, Alignment, Protocol, TLS_HANDSHAKE_RECORD};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::io_util::is_would_block;
use crate::stats::ProxyStatsTracker;
use connection::{Connection, Ctx, Step};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN_TOKEN: usize = 2;

/// 中继读缓冲区大小
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// accept 因资源耗尽失败后的重试间隔
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 从其他线程停止反应器
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// 请求停止；反应器会拆除所有连接后从 `run` 返回
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        self.waker.wake()
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// TCP/TLS 代理
pub struct Proxy {
    poll: Poll,
    listener: TcpListener,
    connections: ConnectionRegistry<Connection>,
    settings: EngineSettings,
    tls: Option<Arc<rustls::ServerConfig>>,
    tokens: TokenAllocator,
    next_id: ConnId,
    stats: ProxyStatsTracker,
    max_events: usize,
    scratch: Vec<u8>,
    reaper: Option<HandshakeReaper>,
    /// 监听队列中可能还有未接入的连接
    accept_retry: bool,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Proxy {
    /// 绑定监听 socket 并准备反应器
    ///
    /// `tls` 模式和 `auto` 模式必须提供 TLS 配置
    pub fn bind(config: &ProxyConfig, tls: Option<Arc<rustls::ServerConfig>>) -> Result<Self> {
        if config.mode.needs_tls() && tls.is_none() {
            return Err(ProxyError::config_error(format!(
                "{} mode requires a certificate and private key",
                config.mode
            )));
        }

        let listen_addr = config
            .listen_socket_addr()
            .map_err(|e| ProxyError::config_error(format!("{:#}", e)))?;
        let backend_addr = config
            .backend_socket_addr()
            .map_err(|e| ProxyError::config_error(format!("{:#}", e)))?;

        let mut listener = crate::net::listen(listen_addr, config.backlog)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        info!(
            "Proxy listening on {} ({} mode{}), forwarding to {}",
            listener.local_addr()?,
            config.mode,
            if config.strict_protocol { ", strict" } else { "" },
            backend_addr
        );

        Ok(Self {
            poll,
            listener,
            connections: ConnectionRegistry::new(),
            settings: EngineSettings {
                mode: config.mode,
                strict_protocol: config.strict_protocol,
                backend_addr,
                tcp_nodelay: config.tcp_nodelay,
            },
            tls,
            tokens: TokenAllocator::new(FIRST_CONN_TOKEN),
            next_id: 1,
            stats: ProxyStatsTracker::new(),
            max_events: config.max_events,
            scratch: vec![0u8; RELAY_BUFFER_SIZE],
            reaper: config.handshake_timeout().map(HandshakeReaper::new),
            accept_retry: false,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// 实际监听地址（端口为 0 时由系统分配）
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 统计计数器（可跨线程读取）
    pub fn stats(&self) -> ProxyStatsTracker {
        self.stats.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    /// 当前存活的连接数
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// 运行事件循环，直到收到停止请求
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.max_events);

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = self.next_poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Event loop failed: {}", e);
                return Err(e.into());
            }

            if self.accept_retry {
                self.accept_all();
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => trace!("Woken up"),
                    token => self.dispatch(token, Readiness::from(event)),
                }
            }

            self.reap_expired();
        }

        self.shutdown_all();
        let stats = self.stats.snapshot();
        info!(
            "Proxy stopped: {} connections ({} bridged, {} rejected, {} failed), {} bytes in, {} bytes out",
            stats.total_connections,
            stats.bridged_connections,
            stats.rejected_connections,
            stats.failed_connections,
            stats.bytes_received,
            stats.bytes_sent
        );
        Ok(())
    }

    /// 接入所有排队的连接
    ///
    /// 监听 socket 是边沿触发的；资源耗尽（如 EMFILE）时队列未清空，
    /// 由事件循环在 [`ACCEPT_RETRY_DELAY`] 后重试
    fn accept_all(&mut self) {
        self.accept_retry = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) => match accept_action(&e) {
                    AcceptAction::Drained => break,
                    AcceptAction::Retry => {
                        trace!("Transient accept error: {}", e);
                        continue;
                    }
                    AcceptAction::Later => {
                        error!(
                            "Failed to accept connection, retrying in {:?}: {}",
                            ACCEPT_RETRY_DELAY, e
                        );
                        self.accept_retry = true;
                        break;
                    }
                },
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        let token = self.tokens.next();
        self.stats.connection_started();
        info!(id, %peer, "Accepted connection");

        let mut conn = Connection::new(id, stream, peer, token);
        let mut ctx = Ctx {
            registry: self.poll.registry(),
            settings: &self.settings,
            tls: self.tls.as_ref(),
            tokens: &mut self.tokens,
            stats: &self.stats,
            scratch: &mut self.scratch,
        };
        let step = conn.start(&mut ctx);
        let backend_token = conn.backend_token();

        if let Some(reaper) = self.reaper.as_mut() {
            reaper.track(id, conn.accepted_at());
        }
        self.connections.insert(id, token, conn);
        self.finish_step(id, step, backend_token);
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) {
        // 同一批次中已拆除连接的事件直接跳过
        let Some((id, side)) = self.connections.lookup(token) else {
            trace!(?token, "Event for a closed connection");
            return;
        };
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        let mut ctx = Ctx {
            registry: self.poll.registry(),
            settings: &self.settings,
            tls: self.tls.as_ref(),
            tokens: &mut self.tokens,
            stats: &self.stats,
            scratch: &mut self.scratch,
        };
        let step = conn.on_ready(side, readiness, &mut ctx);
        let backend_token = conn.backend_token();

        self.finish_step(id, step, backend_token);
    }

    fn finish_step(&mut self, id: ConnId, step: Step, backend_token: Option<Token>) {
        match step {
            Step::Continue => {
                if let Some(token) = backend_token {
                    self.connections.bind_backend(id, token);
                }
            }
            Step::Close(reason) => self.teardown(id, reason),
        }
    }

    /// 唯一的拆除入口：移出注册表、关闭两端、更新统计
    pub fn teardown(&mut self, id: ConnId, reason: CloseReason) {
        let Some(conn) = self.connections.remove(id) else {
            return;
        };
        let peer = conn.peer();
        let state = conn.state();
        let tls = conn.is_tls();
        conn.close(self.poll.registry());
        self.stats.connection_ended();

        match &reason {
            CloseReason::Error(e) if e.is_protocol_mismatch() => {
                self.stats.connection_rejected();
                warn!(id, %peer, "Rejected connection: {}", e);
            }
            CloseReason::Error(e) => {
                self.stats.connection_failed();
                warn!(id, %peer, ?state, tls, "Connection failed: {}", e);
            }
            CloseReason::PeerClosed(_) | CloseReason::Shutdown => {
                info!(id, %peer, tls, "Connection closed: {}", reason);
            }
        }
    }

    /// 下一次 poll 的最长等待时间
    fn next_poll_timeout(&mut self) -> Option<Duration> {
        let reap = self.next_reap_timeout();
        if self.accept_retry {
            return Some(reap.map_or(ACCEPT_RETRY_DELAY, |t| t.min(ACCEPT_RETRY_DELAY)));
        }
        reap
    }

    fn next_reap_timeout(&mut self) -> Option<Duration> {
        let reaper = self.reaper.as_mut()?;
        let timeout = reaper.timeout();
        let connections = &self.connections;
        reaper.next_timeout(Instant::now(), |id| {
            connections
                .get(id)
                .is_some_and(|conn| conn.deadline(timeout).is_some())
        })
    }

    fn reap_expired(&mut self) {
        let now = Instant::now();
        while let Some(reaper) = self.reaper.as_mut() {
            let timeout = reaper.timeout();
            let Some(id) = reaper.pop_expired(now) else {
                break;
            };
            let expired = self
                .connections
                .get(id)
                .is_some_and(|conn| conn.is_expired(now, timeout));
            if expired {
                debug!(id, "Connection did not bridge within {:?}", timeout);
                self.teardown(id, CloseReason::Error(ProxyError::timeout(timeout)));
            }
        }
    }

    fn shutdown_all(&mut self) {
        let ids = self.connections.ids();
        if !ids.is_empty() {
            info!("Closing {} live connections", ids.len());
        }
        for id in ids {
            self.teardown(id, CloseReason::Shutdown);
        }
    }
}

/// accept 失败后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptAction {
    /// 队列已空
    Drained,
    /// 瞬时错误，立即继续
    Retry,
    /// 资源耗尽等错误，稍后重试
    Later,
}

fn accept_action(err: &io::Error) -> AcceptAction {
    if is_would_block(err) {
        return AcceptAction::Drained;
    }
    match err.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => AcceptAction::Retry,
        _ => AcceptAction::Later,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfigBuilder, ProxyMode};
    use std::io::{Read, Write};

    fn config(mode: ProxyMode, backend_port: u16) -> ProxyConfig {
        let mut config = ProxyConfigBuilder::new()
            .listen_addr("127.0.0.1")
            .listen_port(1)
            .backend_port(backend_port)
            .mode(mode)
            .build()
            .unwrap();
        // 由系统分配端口
        config.listen_port = 0;
        config
    }

    #[test]
    fn test_tls_mode_requires_tls_config() {
        let err = Proxy::bind(&config(ProxyMode::Tls, 9), None).err().unwrap();
        assert!(err.is_config_error());
        let err = Proxy::bind(&config(ProxyMode::Auto, 9), None).err().unwrap();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let proxy = Proxy::bind(&config(ProxyMode::Plain, 9), None).unwrap();
        let mut taken = config(ProxyMode::Plain, 9);
        taken.listen_port = proxy.local_addr().unwrap().port();
        let err = Proxy::bind(&taken, None).err().unwrap();
        assert!(matches!(err, ProxyError::BindFailed { .. }));
    }

    #[test]
    fn test_shutdown_stops_run_loop() {
        let backend = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        let mut proxy = Proxy::bind(&config(ProxyMode::Plain, backend_port), None).unwrap();
        let addr = proxy.local_addr().unwrap();
        let handle = proxy.shutdown_handle();
        let stats = proxy.stats();

        let worker = std::thread::spawn(move || {
            proxy.run().unwrap();
            proxy.connection_count()
        });

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (mut upstream, _) = backend.accept().unwrap();
        client.write_all(b"x").unwrap();
        let mut byte = [0u8; 1];
        upstream.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"x");

        handle.shutdown().unwrap();
        assert!(handle.is_shutdown());
        assert_eq!(worker.join().unwrap(), 0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.active_connections, 0);

        // 停止时拆除了存活连接
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(client.read(&mut byte).unwrap(), 0);
    }

    #[test]
    fn test_accept_error_classification() {
        let would_block = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(accept_action(&would_block), AcceptAction::Drained);

        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_action(&aborted), AcceptAction::Retry);

        // EMFILE
        let exhausted = io::Error::from_raw_os_error(24);
        assert_eq!(accept_action(&exhausted), AcceptAction::Later);
    }

    #[test]
    fn test_accept_retry_bounds_poll_timeout() {
        let mut proxy = Proxy::bind(&config(ProxyMode::Plain, 9), None).unwrap();
        assert_eq!(proxy.next_poll_timeout(), None);

        proxy.accept_retry = true;
        assert_eq!(proxy.next_poll_timeout(), Some(ACCEPT_RETRY_DELAY));

        // 再次接入清除重试标记
        proxy.accept_all();
        assert!(!proxy.accept_retry);
        assert_eq!(proxy.next_poll_timeout(), None);
    }

    #[test]
    fn test_reaper_leaves_bridged_connections_alone() {
        let backend = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        let mut config = config(ProxyMode::Plain, backend_port);
        config.handshake_timeout_secs = Some(1);
        let mut proxy = Proxy::bind(&config, None).unwrap();
        let addr = proxy.local_addr().unwrap();
        let handle = proxy.shutdown_handle();
        let stats = proxy.stats();
        let worker = std::thread::spawn(move || proxy.run().unwrap());

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (mut upstream, _) = backend.accept().unwrap();
        std::thread::sleep(Duration::from_millis(1500));

        client.write_all(b"late").unwrap();
        let mut buf = [0u8; 4];
        upstream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        upstream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"late");
        assert_eq!(stats.snapshot().failed_connections, 0);

        handle.shutdown().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_huge_handshake_timeout_never_expires() {
        let backend = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        let mut config = config(ProxyMode::Plain, backend_port);
        config.strict_protocol = true;
        // 绕过校验，直接构造超出 Instant 范围的超时
        config.handshake_timeout_secs = Some(u64::MAX);
        let mut proxy = Proxy::bind(&config, None).unwrap();
        let addr = proxy.local_addr().unwrap();
        let handle = proxy.shutdown_handle();
        let stats = proxy.stats();
        let worker = std::thread::spawn(move || proxy.run());

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let waited = Instant::now();
        while stats.snapshot().total_connections == 0 {
            assert!(waited.elapsed() < Duration::from_secs(5), "connection never accepted");
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(stats.snapshot().active_connections, 1);

        handle.shutdown().unwrap();
        assert!(worker.join().unwrap().is_ok());
    }
}
