//! Health check probe logic.
//!
//! Probes run at the target group's fixed interval; thresholds on
//! consecutive results decide the target state.

use std::sync::Arc;
use std::time::Duration;

use edgechain_core::{HealthCheckSpec, Protocol};
use edgechain_state::TargetHealthState;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::BoxFuture;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The target answered 2xx (or accepted the connection, for TCP checks).
    Healthy,
    /// The target answered non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_success(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Tracks consecutive probe results for a single target.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: TargetHealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    interval: Duration,
}

impl HealthTracker {
    pub fn new(spec: &HealthCheckSpec) -> Self {
        Self::with_thresholds(spec.unhealthy_threshold, spec.healthy_threshold, spec.interval)
    }

    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32, interval: Duration) -> Self {
        Self {
            state: TargetHealthState::Initial,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
            interval,
        }
    }

    /// Record a probe result and return the new state.
    pub fn record(&mut self, result: ProbeResult) -> TargetHealthState {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.healthy_threshold
                    && self.state != TargetHealthState::Healthy
                {
                    debug!(successes = self.consecutive_successes, "target healthy");
                    self.state = TargetHealthState::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.unhealthy_threshold
                    && self.state != TargetHealthState::Unhealthy
                {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "target unhealthy"
                    );
                    self.state = TargetHealthState::Unhealthy;
                }
            }
        }
        self.state
    }

    pub fn state(&self) -> TargetHealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Probes run on a fixed schedule regardless of results.
    pub fn next_interval(&self) -> Duration {
        self.interval
    }
}

/// Where and how to probe one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Target id as registered in its group.
    pub id: String,
    /// `host:port` to connect to.
    pub address: String,
    pub protocol: Protocol,
    pub path: String,
    pub timeout: Duration,
}

impl ProbeTarget {
    pub fn new(id: &str, address: &str, spec: &HealthCheckSpec) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            protocol: spec.protocol,
            path: spec.path.clone(),
            timeout: spec.timeout,
        }
    }
}

pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, ProbeResult>;
}

/// Probes over real sockets. HTTP and HTTPS checks issue a `GET` and need a
/// 2xx answer; TCP checks only need the connection to be accepted.
#[derive(Debug, Clone)]
pub struct NetworkProber {
    tls: Arc<rustls::ClientConfig>,
}

impl NetworkProber {
    pub fn new() -> Result<Self, rustls::Error> {
        Ok(Self {
            tls: Arc::new(probe_tls_config()?),
        })
    }
}

impl Prober for NetworkProber {
    fn probe<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async move {
            match target.protocol {
                Protocol::Http => http_probe(&target.address, &target.path, target.timeout).await,
                Protocol::Https => {
                    https_probe(&target.address, &target.path, target.timeout, Arc::clone(&self.tls)).await
                }
                Protocol::Tcp | Protocol::Udp => tcp_probe(&target.address, target.timeout).await,
            }
        })
    }
}

/// Client config for HTTPS probes. The target's certificate chain is not
/// validated: targets present the certificate of the public service name,
/// not of the address being probed. Handshake signatures still are.
pub fn probe_tls_config() -> Result<rustls::ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(UnvalidatedChain(provider)))
        .with_no_client_auth())
}

#[derive(Debug)]
struct UnvalidatedChain(Arc<CryptoProvider>);

impl ServerCertVerifier for UnvalidatedChain {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };
        get(stream, &uri, address).await
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        ProbeResult::Failed
    })
}

/// HTTP probe over TLS. A failed handshake counts as `Failed`, a non-2xx
/// answer from the decrypted side as `Unhealthy`.
pub async fn https_probe(
    address: &str,
    path: &str,
    timeout: Duration,
    tls: Arc<rustls::ClientConfig>,
) -> ProbeResult {
    let uri = format!("https://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
        let server_name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(e) => {
                debug!(error = %e, %uri, "health probe host is not a valid server name");
                return ProbeResult::Failed;
            }
        };
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };
        let stream = match TlsConnector::from(tls).connect(server_name, stream).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe tls handshake failed");
                return ProbeResult::Failed;
            }
        };
        get(stream, &uri, address).await
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        ProbeResult::Failed
    })
}

async fn get<S>(stream: S, uri: &str, host: &str) -> ProbeResult
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %uri, "health probe handshake failed");
            return ProbeResult::Failed;
        }
    };

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("GET")
        .uri(uri)
        .header("host", host)
        .header("user-agent", "edgechain-health/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, %uri, "health probe request invalid");
            return ProbeResult::Failed;
        }
    };

    match sender.send_request(req).await {
        Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
        Ok(resp) => {
            debug!(status = %resp.status(), %uri, "health probe non-2xx");
            ProbeResult::Unhealthy
        }
        Err(e) => {
            debug!(error = %e, %uri, "health probe request failed");
            ProbeResult::Failed
        }
    }
}

/// Connection-level probe.
pub async fn tcp_probe(address: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await {
        Ok(Ok(_)) => ProbeResult::Healthy,
        Ok(Err(e)) => {
            debug!(error = %e, address, "tcp probe refused");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(address, "tcp probe timed out");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tracker() -> HealthTracker {
        HealthTracker::new(&HealthCheckSpec::default())
    }

    #[test]
    fn tracker_starts_initial() {
        let t = tracker();
        assert_eq!(t.state(), TargetHealthState::Initial);
        assert_eq!(t.next_interval(), Duration::from_secs(30));
    }

    #[test]
    fn healthy_only_after_two_successes() {
        let mut t = tracker();
        assert_eq!(t.record(ProbeResult::Healthy), TargetHealthState::Initial);
        assert_eq!(t.record(ProbeResult::Healthy), TargetHealthState::Healthy);
    }

    #[test]
    fn unhealthy_only_after_three_failures() {
        let mut t = tracker();
        t.record(ProbeResult::Healthy);
        t.record(ProbeResult::Healthy);

        assert_eq!(t.record(ProbeResult::Unhealthy), TargetHealthState::Healthy);
        assert_eq!(t.record(ProbeResult::Failed), TargetHealthState::Healthy);
        assert_eq!(t.consecutive_failures(), 2);
        assert_eq!(t.record(ProbeResult::Unhealthy), TargetHealthState::Unhealthy);
    }

    #[test]
    fn interleaved_results_do_not_flap() {
        let mut t = tracker();
        t.record(ProbeResult::Healthy);
        t.record(ProbeResult::Healthy);
        for _ in 0..10 {
            t.record(ProbeResult::Failed);
            t.record(ProbeResult::Failed);
            assert_eq!(t.record(ProbeResult::Healthy), TargetHealthState::Healthy);
        }
    }

    #[test]
    fn recovery_needs_two_successes() {
        let mut t = tracker();
        for _ in 0..3 {
            t.record(ProbeResult::Failed);
        }
        assert_eq!(t.state(), TargetHealthState::Unhealthy);
        assert_eq!(t.record(ProbeResult::Healthy), TargetHealthState::Unhealthy);
        assert_eq!(t.consecutive_successes(), 1);
        assert_eq!(t.record(ProbeResult::Healthy), TargetHealthState::Healthy);
    }

    #[test]
    fn custom_thresholds() {
        let mut t = HealthTracker::with_thresholds(5, 3, Duration::from_secs(10));
        for _ in 0..4 {
            t.record(ProbeResult::Unhealthy);
        }
        assert_eq!(t.state(), TargetHealthState::Initial);
        t.record(ProbeResult::Unhealthy);
        assert_eq!(t.state(), TargetHealthState::Unhealthy);
    }

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn http_probe_ok() {
        let addr = serve_once("HTTP/1.1 200 OK").await;
        assert_eq!(http_probe(&addr, "/", Duration::from_secs(2)).await, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn http_probe_non_2xx() {
        let addr = serve_once("HTTP/1.1 503 Service Unavailable").await;
        assert_eq!(
            http_probe(&addr, "/", Duration::from_secs(2)).await,
            ProbeResult::Unhealthy
        );
    }

    #[tokio::test]
    async fn probes_to_closed_port_fail() {
        assert_eq!(
            http_probe("127.0.0.1:1", "/", Duration::from_millis(200)).await,
            ProbeResult::Failed
        );
        assert_eq!(tcp_probe("127.0.0.1:1", Duration::from_millis(200)).await, ProbeResult::Failed);
    }

    async fn serve_tls_once(status_line: &'static str) -> String {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["internal.edgechain.local".to_string()]).unwrap();
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![cert.der().clone()],
                rustls::pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
            )
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(socket).await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tls.read(&mut buf).await;
            let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
            tls.write_all(response.as_bytes()).await.unwrap();
            tls.flush().await.unwrap();
        });
        addr
    }

    fn https_target(address: String) -> ProbeTarget {
        ProbeTarget {
            id: "listener".to_string(),
            address,
            protocol: Protocol::Https,
            path: "/".to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn https_probe_ok() {
        let prober = NetworkProber::new().unwrap();
        let target = https_target(serve_tls_once("HTTP/1.1 200 OK").await);
        assert_eq!(prober.probe(&target).await, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn https_probe_needs_2xx_behind_the_handshake() {
        let prober = NetworkProber::new().unwrap();
        let target = https_target(serve_tls_once("HTTP/1.1 503 Service Unavailable").await);
        assert_eq!(prober.probe(&target).await, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn https_probe_fails_when_nothing_answers_the_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut target = https_target(listener.local_addr().unwrap().to_string());
        target.timeout = Duration::from_millis(300);
        assert_eq!(NetworkProber::new().unwrap().probe(&target).await, ProbeResult::Failed);
        drop(listener);
    }
}
