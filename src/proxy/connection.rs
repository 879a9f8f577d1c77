//! 单个客户端连接的状态机
//!
//! `Accepted → Handshaking → ProtocolChecking → Connecting → Bridged → Closed`，
//! 其中握手只在 TLS 路径出现，协议检查只在自动检测或严格模式下出现。
//! 状态机不自行销毁连接：需要关闭时返回 [`Step::Close`]，由反应器统一拆除。

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use super::registry::{ConnId, Side, TokenAllocator};
use super::relay::{pump, Endpoint, PlainEndpoint, RelayOutcome, TlsEndpoint};
use super::session::{HandshakeOutcome, TlsSession};
use super::sniff::{self, Alignment, Protocol};
use crate::config::ProxyMode;
use crate::error::ProxyError;
use crate::io_util::WriteOutcome;
use crate::net::{self, ConnectProgress};
use crate::stats::ProxyStatsTracker;

/// 连接引擎的运行参数，启动时确定，之后只读
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mode: ProxyMode,
    pub strict_protocol: bool,
    pub backend_addr: SocketAddr,
    pub tcp_nodelay: bool,
}

impl EngineSettings {
    /// 接入后是否需要先嗅探首字节
    fn sniffs(&self) -> bool {
        self.mode == ProxyMode::Auto || self.strict_protocol
    }
}

/// 状态机每一步需要的反应器资源
pub struct Ctx<'a> {
    pub registry: &'a mio::Registry,
    pub settings: &'a EngineSettings,
    pub tls: Option<&'a Arc<rustls::ServerConfig>>,
    pub tokens: &'a mut TokenAllocator,
    pub stats: &'a ProxyStatsTracker,
    pub scratch: &'a mut [u8],
}

/// 连接生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Handshaking,
    ProtocolChecking,
    Connecting,
    Bridged,
    Closed,
}

/// 关闭原因
#[derive(Debug)]
pub enum CloseReason {
    /// 一端正常关闭
    PeerClosed(Side),
    /// 握手失败、协议不匹配、后端不可达、I/O 错误或超时
    Error(ProxyError),
    /// 反应器退出
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed(side) => write!(f, "{} closed", side),
            CloseReason::Error(e) => write!(f, "{}", e),
            CloseReason::Shutdown => write!(f, "proxy shutting down"),
        }
    }
}

impl From<ProxyError> for CloseReason {
    fn from(err: ProxyError) -> Self {
        CloseReason::Error(err)
    }
}

/// 一次分发的结果
#[derive(Debug)]
pub enum Step {
    Continue,
    Close(CloseReason),
}

impl Step {
    fn error(err: impl Into<ProxyError>) -> Self {
        Step::Close(CloseReason::Error(err.into()))
    }
}

/// 就绪事件的摘要
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
}

impl Readiness {
    /// 可读或对端已关闭（读会立即返回）
    pub fn can_read(&self) -> bool {
        self.readable || self.closed
    }

    /// 可写或出错（连接结果已确定）
    pub fn can_write(&self) -> bool {
        self.writable || self.closed
    }

    /// 读写均就绪
    pub fn all() -> Self {
        Self {
            readable: true,
            writable: true,
            closed: false,
        }
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_write_closed() || event.is_error(),
        }
    }
}

/// 一个客户端连接及其后端连接
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    client: TcpStream,
    client_token: Token,
    backend: Option<TcpStream>,
    backend_token: Option<Token>,
    tls: Option<TlsSession>,
    state: ConnState,
    /// 已从客户端读出、尚未写入后端的数据
    to_backend: Vec<u8>,
    /// 已从后端读出、尚未写入客户端的数据
    to_client: Vec<u8>,
    accepted_at: Instant,
    busy: bool,
}

impl Connection {
    pub fn new(id: ConnId, client: TcpStream, peer: SocketAddr, client_token: Token) -> Self {
        Self {
            id,
            peer,
            client,
            client_token,
            backend: None,
            backend_token: None,
            tls: None,
            state: ConnState::Accepted,
            to_backend: Vec::new(),
            to_client: Vec::new(),
            accepted_at: Instant::now(),
            busy: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn backend_token(&self) -> Option<Token> {
        self.backend_token
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    /// 未桥接连接的回收时间点；超出 `Instant` 表示范围时永不过期
    pub fn deadline(&self, timeout: Duration) -> Option<Instant> {
        match self.state {
            ConnState::Bridged | ConnState::Closed => None,
            _ => self.accepted_at.checked_add(timeout),
        }
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.deadline(timeout).is_some_and(|deadline| now >= deadline)
    }

    /// 注册客户端并进入第一个状态
    pub fn start(&mut self, ctx: &mut Ctx<'_>) -> Step {
        self.acquire();
        let step = self.admit(ctx);
        self.release();
        step
    }

    /// 处理某一端的就绪事件
    pub fn on_ready(&mut self, side: Side, readiness: Readiness, ctx: &mut Ctx<'_>) -> Step {
        trace!(id = self.id, %side, ?readiness, state = ?self.state, "Readiness");
        self.acquire();
        let step = match (self.state, side) {
            (ConnState::Handshaking, Side::Client) => self.drive_handshake(ctx),
            (ConnState::ProtocolChecking, Side::Client) if readiness.can_read() => {
                self.check_protocol(ctx)
            }
            // 非阻塞 connect 的结果只随可写或错误通知到达
            (ConnState::Connecting, Side::Backend) if readiness.can_write() => {
                self.finish_connect(ctx)
            }
            (ConnState::Bridged, _) => self.relay(ctx),
            // 客户端在后端连上之前发来的数据留在内核缓冲区，桥接时一并处理
            _ => Step::Continue,
        };
        self.release();
        step
    }

    fn acquire(&mut self) {
        debug_assert!(!self.busy, "re-entrant dispatch into connection {}", self.id);
        self.busy = true;
    }

    fn release(&mut self) {
        self.busy = false;
    }

    fn admit(&mut self, ctx: &mut Ctx<'_>) -> Step {
        if let Err(e) = ctx
            .registry
            .register(&mut self.client, self.client_token, Interest::READABLE)
        {
            return Step::error(e);
        }
        if ctx.settings.tcp_nodelay {
            if let Err(e) = self.client.set_nodelay(true) {
                debug!(id = self.id, "Failed to set TCP_NODELAY on client: {}", e);
            }
        }

        if ctx.settings.sniffs() {
            self.state = ConnState::ProtocolChecking;
            // 数据可能在注册前就已到达
            return self.check_protocol(ctx);
        }

        match ctx.settings.mode {
            ProxyMode::Tls => self.begin_handshake(ctx),
            _ => self.connect_backend(ctx),
        }
    }

    fn check_protocol(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let mode = ctx.settings.mode;
        match sniff::check_protocol(&self.client, mode) {
            Alignment::Indeterminate => Step::Continue,
            Alignment::PeerClosed => Step::Close(CloseReason::PeerClosed(Side::Client)),
            Alignment::Failed(e) => Step::error(e),
            Alignment::ProtocolMismatchPlain => {
                Step::error(ProxyError::protocol_mismatch(Protocol::Tls, mode))
            }
            Alignment::ProtocolMismatchTls => {
                Step::error(ProxyError::protocol_mismatch(Protocol::Plain, mode))
            }
            Alignment::Matched(Protocol::Tls) => {
                debug!(id = self.id, peer = %self.peer, "Detected TLS client");
                self.begin_handshake(ctx)
            }
            Alignment::Matched(Protocol::Plain) => {
                debug!(id = self.id, peer = %self.peer, "Detected plaintext client");
                self.connect_backend(ctx)
            }
        }
    }

    fn begin_handshake(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let Some(config) = ctx.tls else {
            return Step::error(ProxyError::config_error(
                "TLS client accepted without a TLS configuration",
            ));
        };
        match TlsSession::new(config.clone()) {
            Ok(session) => self.tls = Some(session),
            Err(e) => return Step::error(ProxyError::TlsError(e.to_string())),
        }
        self.state = ConnState::Handshaking;
        self.drive_handshake(ctx)
    }

    fn drive_handshake(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let Some(session) = self.tls.as_mut() else {
            return Step::error(ProxyError::handshake_failed("no TLS session"));
        };

        match session.accept_step(&mut self.client) {
            HandshakeOutcome::Established => {
                debug!(id = self.id, peer = %self.peer, "TLS handshake complete");
                self.connect_backend(ctx)
            }
            HandshakeOutcome::WouldBlock => {
                let interest = if session.wants_write() {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                match ctx
                    .registry
                    .reregister(&mut self.client, self.client_token, interest)
                {
                    Ok(()) => Step::Continue,
                    Err(e) => Step::error(e),
                }
            }
            HandshakeOutcome::Failed(e) => Step::error(ProxyError::handshake_failed(e.to_string())),
        }
    }

    fn connect_backend(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let addr = ctx.settings.backend_addr;
        let mut backend = match net::connect_nonblocking(addr) {
            Ok(stream) => stream,
            Err(e) => return Step::error(e),
        };

        let token = ctx.tokens.next();
        if let Err(e) = ctx.registry.register(
            &mut backend,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            return Step::error(e);
        }

        debug!(id = self.id, backend = %addr, "Connecting to backend");
        self.backend = Some(backend);
        self.backend_token = Some(token);
        self.state = ConnState::Connecting;
        Step::Continue
    }

    fn finish_connect(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let Some(backend) = self.backend.as_ref() else {
            return Step::Continue;
        };

        match net::connect_progress(backend) {
            ConnectProgress::InProgress => Step::Continue,
            ConnectProgress::Failed(e) => Step::error(ProxyError::connection_failed(
                ctx.settings.backend_addr.to_string(),
                e,
            )),
            ConnectProgress::Connected => {
                if ctx.settings.tcp_nodelay {
                    if let Err(e) = backend.set_nodelay(true) {
                        debug!(id = self.id, "Failed to set TCP_NODELAY on backend: {}", e);
                    }
                }
                if let Err(e) = ctx.registry.reregister(
                    &mut self.client,
                    self.client_token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    return Step::error(e);
                }

                self.state = ConnState::Bridged;
                ctx.stats.connection_bridged();
                info!(
                    id = self.id,
                    peer = %self.peer,
                    tls = self.tls.is_some(),
                    "Bridged to backend {}",
                    ctx.settings.backend_addr
                );

                // 边沿触发：桥接前已到达的数据不会再有通知
                self.relay(ctx)
            }
        }
    }

    /// 双向中继；任一端就绪都会驱动两个方向
    fn relay(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let Some(backend) = self.backend.as_mut() else {
            return Step::Continue;
        };

        let upstream = match self.tls.as_mut() {
            Some(session) => pump(
                &mut TlsEndpoint::new(session, &mut self.client),
                &mut PlainEndpoint::new(&mut *backend),
                &mut self.to_backend,
                ctx.scratch,
            ),
            None => pump(
                &mut PlainEndpoint::new(&mut self.client),
                &mut PlainEndpoint::new(&mut *backend),
                &mut self.to_backend,
                ctx.scratch,
            ),
        };
        ctx.stats.add_bytes_received(upstream.forwarded);
        if let Some(step) = finished(upstream.outcome, Side::Client) {
            return step;
        }

        let downstream = match self.tls.as_mut() {
            Some(session) => pump(
                &mut PlainEndpoint::new(&mut *backend),
                &mut TlsEndpoint::new(session, &mut self.client),
                &mut self.to_client,
                ctx.scratch,
            ),
            None => pump(
                &mut PlainEndpoint::new(&mut *backend),
                &mut PlainEndpoint::new(&mut self.client),
                &mut self.to_client,
                ctx.scratch,
            ),
        };
        ctx.stats.add_bytes_sent(downstream.forwarded);
        if let Some(step) = finished(downstream.outcome, Side::Backend) {
            return step;
        }

        trace!(
            id = self.id,
            up = upstream.forwarded,
            down = downstream.forwarded,
            pending_up = self.to_backend.len(),
            pending_down = self.to_client.len(),
            "Relay pass"
        );
        Step::Continue
    }

    /// 注销并关闭两端句柄，释放 TLS 会话
    ///
    /// 积压数据和 TLS close_notify 只做一次非阻塞的尽力发送
    pub fn close(mut self, registry: &mio::Registry) {
        if let Some(backend) = self.backend.as_mut() {
            let _ = registry.deregister(backend);
        }
        let _ = registry.deregister(&mut self.client);

        if let Some(backend) = self.backend.as_mut() {
            flush_pending(&mut PlainEndpoint::new(backend), &mut self.to_backend);
        }
        match self.tls.as_mut() {
            Some(session) => {
                flush_pending(
                    &mut TlsEndpoint::new(session, &mut self.client),
                    &mut self.to_client,
                );
                session.close(&mut self.client);
            }
            None => flush_pending(&mut PlainEndpoint::new(&mut self.client), &mut self.to_client),
        }

        self.state = ConnState::Closed;
        self.tls = None;
        self.backend = None;
        trace!(id = self.id, "Connection released");
    }
}

fn finished(outcome: RelayOutcome, source: Side) -> Option<Step> {
    match outcome {
        RelayOutcome::Open => None,
        RelayOutcome::PeerClosed => Some(Step::Close(CloseReason::PeerClosed(source))),
        RelayOutcome::Failed(e) => Some(Step::error(e)),
    }
}

fn flush_pending<E: Endpoint>(dst: &mut E, pending: &mut Vec<u8>) {
    let _ = dst.flush();
    let mut written = 0;
    while written < pending.len() {
        match dst.write(&pending[written..]) {
            WriteOutcome::Data(n) => written += n,
            WriteOutcome::WouldBlock | WriteOutcome::Failed(_) => break,
        }
    }
    pending.clear();
}
