//! Common utilities for integration tests
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tls_edge_proxy::{
    Proxy, ProxyConfig, ProxyConfigBuilder, ProxyMode, ProxyStatsTracker, ShutdownHandle,
};

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use std::sync::atomic::AtomicU64;
    use tls_edge_proxy::tls;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}

/// Test backend: every accepted connection is handed to `handler` on its own thread,
/// and whatever the handler returns is reported once the connection is done
pub struct Backend {
    pub addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    finished: mpsc::Receiver<Vec<u8>>,
}

impl Backend {
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(TcpStream) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind backend");
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let (tx, finished) = mpsc::channel();
        let handler = Arc::new(handler);

        let counter = accepts.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    let _ = tx.send(handler(stream));
                });
            }
        });

        Self {
            addr,
            accepts,
            finished,
        }
    }

    /// Echo everything back until the peer closes; reports the bytes seen
    pub fn echo() -> Self {
        Self::spawn(|mut stream| {
            let mut seen = Vec::new();
            let mut buf = vec![0u8; 8192];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        seen.extend_from_slice(&buf[..n]);
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
            seen
        })
    }

    /// Read until the peer closes; reports everything received
    pub fn sink() -> Self {
        Self::spawn(|mut stream| {
            let mut received = Vec::new();
            let _ = stream.read_to_end(&mut received);
            received
        })
    }

    /// Send `payload`, then close
    pub fn source(payload: Vec<u8>) -> Self {
        Self::spawn(move |mut stream| {
            let _ = stream.write_all(&payload);
            Vec::new()
        })
    }

    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Wait for one backend connection to finish
    pub fn wait_finished(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.finished.recv_timeout(timeout).ok()
    }
}

/// A proxy running on a background thread; stopped on drop
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub stats: ProxyStatsTracker,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl RunningProxy {
    pub fn start(config: ProxyConfig, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        let mut proxy = Proxy::bind(&config, tls).expect("Failed to bind proxy");
        let addr = proxy.local_addr().unwrap();
        let stats = proxy.stats();
        let handle = proxy.shutdown_handle();

        let thread = std::thread::spawn(move || {
            proxy.run().expect("Proxy event loop failed");
        });

        Self {
            addr,
            stats,
            handle,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        let _ = self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("Proxy thread panicked");
        }
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Proxy configuration on an ephemeral loopback port
pub fn proxy_config(mode: ProxyMode, backend: SocketAddr) -> ProxyConfigBuilder {
    ProxyConfigBuilder::new()
        .listen_addr("127.0.0.1")
        .listen_port(get_available_port())
        .backend_addr(backend.ip().to_string())
        .backend_port(backend.port())
        .mode(mode)
}

/// Server TLS config plus a client config that trusts it
pub fn tls_pair(
    cert: &Path,
    key: &Path,
) -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
    let server = tls_edge_proxy::tls::load_server_config(cert, key)
        .expect("Failed to load server TLS config");

    let mut roots = rustls::RootCertStore::empty();
    let mut reader = std::io::BufReader::new(std::fs::File::open(cert).unwrap());
    for c in rustls_pemfile::certs(&mut reader) {
        roots.add(c.unwrap()).unwrap();
    }
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (server, Arc::new(client))
}

pub type TlsClient = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Connect a TLS client through the proxy
pub fn tls_connect(addr: SocketAddr, config: Arc<rustls::ClientConfig>) -> TlsClient {
    let sock = TcpStream::connect(addr).expect("Failed to connect to proxy");
    sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let conn = rustls::ClientConnection::new(config, name).unwrap();
    rustls::StreamOwned::new(conn, sock)
}

/// Connect a plaintext client through the proxy
pub fn plain_connect(addr: SocketAddr) -> TcpStream {
    let sock = TcpStream::connect(addr).expect("Failed to connect to proxy");
    sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    sock
}

/// Read until `len` bytes arrived or the stream ends
pub fn read_len<R: Read>(reader: &mut R, len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    let mut buf = vec![0u8; 16 * 1024];
    while data.len() < len {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    }
    data
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
