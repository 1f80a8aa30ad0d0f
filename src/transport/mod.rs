//! Single-connection SMTP client used for probing.
//!
//! One `SmtpConnection` is one TCP connection to one exchanger. It walks the
//! `ProbeState` machine: connect and read the banner, greet, optionally
//! upgrade with STARTTLS, then `MAIL FROM` and `RCPT TO`. Every read and
//! write is bounded by the read timeout and every reply line by
//! `MAX_LINE_LEN`. A connection that hit an I/O error or a timeout is
//! marked broken and is never reused.
//!
//! Opportunistic STARTTLS (`StartTlsMode::Auto`) encrypts without checking
//! the server certificate, since many exchangers present self-signed or
//! mismatched ones. Required STARTTLS checks it against the webpki roots
//! unless told otherwise.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::StartTlsMode;
use crate::errors::{VerifyError, VerifyErrorKind, VerifyResult};
use crate::protocol::{codes, EsmtpCapabilities, ProbeState, SmtpCommand, SmtpResponse};

/// Upper bound on lines in one multiline reply.
const MAX_REPLY_LINES: usize = 128;

/// Upper bound on the length of one reply line, CRLF included.
pub const MAX_LINE_LEN: usize = 4096;

/// Certificate verifier for opportunistic TLS.
///
/// Accepts any certificate chain but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyCertificate {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<tokio_rustls::client::TlsStream<TcpStream>>>),
}

/// Probe connection to one mail exchanger.
pub struct SmtpConnection {
    stream: Option<TransportStream>,
    host: String,
    port: u16,
    read_timeout: Duration,
    state: ProbeState,
    capabilities: Option<EsmtpCapabilities>,
    helo_domain: Option<String>,
    tls: bool,
    broken: bool,
    created_at: Instant,
    last_used_at: Instant,
    transcript: Option<Vec<String>>,
}

impl fmt::Debug for SmtpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("tls", &self.tls)
            .field("broken", &self.broken)
            .finish()
    }
}

impl SmtpConnection {
    /// Connects to an exchanger and reads its banner.
    ///
    /// A banner other than 2xx (for example `554 blocked`) closes the socket
    /// and is returned as an error carrying the reply code.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> VerifyResult<Self> {
        let address = format!("{}:{}", host, port);
        debug!(address = %address, "Connecting to mail exchanger");

        let stream = timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| VerifyError::timeout(format!("Connect to {} timed out", address)))?
            .map_err(|e| Self::map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        let now = Instant::now();
        let mut conn = Self {
            stream: Some(TransportStream::Plain(BufReader::new(stream))),
            host: host.to_string(),
            port,
            read_timeout,
            state: ProbeState::Disconnected,
            capabilities: None,
            helo_domain: None,
            tls: false,
            broken: false,
            created_at: now,
            last_used_at: now,
            transcript: None,
        };

        let banner = conn.read_response().await?;
        if !banner.is_success() {
            conn.stream = None;
            conn.state = ProbeState::Closed;
            return Err(banner.to_error());
        }

        conn.state = ProbeState::Connected;
        Ok(conn)
    }

    fn map_io_error(error: io::Error, address: &str) -> VerifyError {
        let message = match error.kind() {
            io::ErrorKind::ConnectionRefused => format!("Connection refused by {}", address),
            io::ErrorKind::ConnectionReset => format!("Connection reset by {}", address),
            io::ErrorKind::TimedOut => {
                return VerifyError::timeout(format!("Connect to {} timed out", address)).with_cause(error)
            }
            _ => format!("Cannot connect to {}: {}", address, error),
        };
        VerifyError::connect(message).with_cause(error)
    }

    /// Sends EHLO, falling back to HELO when EHLO is not recognized.
    pub async fn greet(&mut self, helo_domain: &str) -> VerifyResult<&EsmtpCapabilities> {
        let response = self.send_command(&SmtpCommand::Ehlo(helo_domain.to_string())).await?;

        let capabilities = if response.is_success() {
            EsmtpCapabilities::from_ehlo_response(&response)
        } else if matches!(response.code, codes::SYNTAX_ERROR | codes::NOT_IMPLEMENTED) {
            debug!(host = %self.host, "EHLO refused, falling back to HELO");
            let response = self.send_command(&SmtpCommand::Helo(helo_domain.to_string())).await?;
            if !response.is_success() {
                return Err(response.to_error());
            }
            EsmtpCapabilities::default()
        } else {
            return Err(response.to_error());
        };

        self.helo_domain = Some(helo_domain.to_string());
        self.state = ProbeState::Greeted;
        Ok(&*self.capabilities.insert(capabilities))
    }

    /// Negotiates STARTTLS according to `mode`.
    ///
    /// Returns whether the connection is now encrypted. In `Auto` mode a
    /// missing or refused STARTTLS leaves the connection in clear text and
    /// the certificate is not checked. In `On` mode the certificate must
    /// chain to a webpki root unless `accept_invalid_certs` is set. A failed
    /// handshake is always an error because the socket is gone.
    pub async fn starttls(
        &mut self,
        mode: StartTlsMode,
        accept_invalid_certs: bool,
    ) -> VerifyResult<bool> {
        if self.tls {
            return Ok(true);
        }
        if mode == StartTlsMode::Off {
            return Ok(false);
        }
        if !self.state.can_starttls() {
            return Err(VerifyError::protocol(format!(
                "STARTTLS not allowed in state {}",
                self.state
            )));
        }

        let offered = self.capabilities.as_ref().map_or(false, |c| c.starttls);
        if !offered {
            return match mode {
                StartTlsMode::On => Err(VerifyError::new(
                    VerifyErrorKind::TlsUnavailable,
                    format!("{} does not offer STARTTLS", self.host),
                )),
                _ => Ok(false),
            };
        }

        let response = self.send_command(&SmtpCommand::StartTls).await?;
        if !response.is_success() {
            return match mode {
                StartTlsMode::On => Err(VerifyError::new(
                    VerifyErrorKind::TlsUnavailable,
                    format!("STARTTLS refused: {}", response),
                )
                .with_smtp_code(response.code)),
                _ => Ok(false),
            };
        }

        let verify_certificate = mode == StartTlsMode::On && !accept_invalid_certs;
        self.upgrade_tls(verify_certificate).await?;

        // RFC 3207: forget everything learnt before the upgrade
        let helo = self.helo_domain.clone().unwrap_or_else(|| "localhost".to_string());
        self.capabilities = None;
        self.greet(&helo).await?;
        Ok(true)
    }

    async fn upgrade_tls(&mut self, verify_certificate: bool) -> VerifyResult<()> {
        let tcp_stream = match self.stream.take() {
            Some(TransportStream::Plain(reader)) => reader.into_inner(),
            Some(tls @ TransportStream::Tls(_)) => {
                self.stream = Some(tls);
                return Ok(());
            }
            None => return Err(VerifyError::not_connected()),
        };
        // Until the handshake succeeds there is no usable stream
        self.broken = true;
        self.state = ProbeState::Closed;

        let tls_config = if verify_certificate {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate::new()))
                .with_no_client_auth()
        };
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| VerifyError::tls(format!("Invalid server name: {}", self.host)))?;

        let tls_stream = timeout(self.read_timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| VerifyError::timeout("TLS handshake timed out"))?
            .map_err(|e| VerifyError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        self.stream = Some(TransportStream::Tls(Box::new(BufReader::new(tls_stream))));
        self.tls = true;
        self.broken = false;
        self.state = ProbeState::TlsNegotiated;
        debug!(host = %self.host, verified = verify_certificate, "STARTTLS negotiated");
        Ok(())
    }

    /// Sends `MAIL FROM` and returns the reply, accepted or not.
    pub async fn mail_from(&mut self, address: &str) -> VerifyResult<SmtpResponse> {
        if !self.state.can_start_mail() {
            return Err(VerifyError::protocol(format!(
                "MAIL FROM not allowed in state {}",
                self.state
            )));
        }
        let response = self
            .send_command(&SmtpCommand::MailFrom {
                address: address.to_string(),
            })
            .await?;
        if response.is_success() {
            self.state = ProbeState::MailFromSent;
        }
        Ok(response)
    }

    /// Sends `RCPT TO` and returns the reply, accepted or not.
    pub async fn rcpt_to(&mut self, address: &str) -> VerifyResult<SmtpResponse> {
        if !self.state.can_add_recipient() {
            return Err(VerifyError::protocol(format!(
                "RCPT TO not allowed in state {}",
                self.state
            )));
        }
        let response = self
            .send_command(&SmtpCommand::RcptTo {
                address: address.to_string(),
            })
            .await?;
        self.state = ProbeState::RcptToSent;
        Ok(response)
    }

    /// Marks the final reply as classified.
    pub fn mark_classified(&mut self) {
        if self.state.is_open() {
            self.state = ProbeState::Classified;
        }
    }

    /// Aborts the current transaction so the connection can be reused.
    pub async fn rset(&mut self) -> VerifyResult<()> {
        let response = self.send_command(&SmtpCommand::Rset).await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
        if self.helo_domain.is_some() {
            self.state = ProbeState::Greeted;
        }
        Ok(())
    }

    /// Sends NOOP to check that the server is still responsive.
    pub async fn noop(&mut self) -> VerifyResult<()> {
        let response = self.send_command(&SmtpCommand::Noop).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(response.to_error())
        }
    }

    /// Sends a command and reads the reply.
    pub async fn send_command(&mut self, command: &SmtpCommand) -> VerifyResult<SmtpResponse> {
        if self.stream.is_none() || self.broken {
            return Err(VerifyError::not_connected());
        }

        let line = format!("{}\r\n", command.to_smtp_string());
        trace!(host = %self.host, command = %command, "Sending SMTP command");
        self.record(format!("C: {}", command));

        let read_timeout = self.read_timeout;
        let result = match self.stream.as_mut() {
            Some(TransportStream::Plain(stream)) => {
                Self::write_all(stream.get_mut(), line.as_bytes(), read_timeout).await
            }
            Some(TransportStream::Tls(stream)) => {
                Self::write_all(stream.get_mut(), line.as_bytes(), read_timeout).await
            }
            None => Err(VerifyError::not_connected()),
        };
        if let Err(e) = result {
            self.broken = true;
            return Err(e);
        }

        self.read_response().await
    }

    async fn read_response(&mut self) -> VerifyResult<SmtpResponse> {
        let read_timeout = self.read_timeout;
        let result = match self.stream.as_mut() {
            Some(TransportStream::Plain(stream)) => Self::read_lines(stream, read_timeout).await,
            Some(TransportStream::Tls(stream)) => Self::read_lines(stream.as_mut(), read_timeout).await,
            None => Err(VerifyError::not_connected()),
        };

        let lines = match result {
            Ok(lines) => lines,
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        };

        for line in &lines {
            self.record(format!("S: {}", line));
        }
        self.last_used_at = Instant::now();

        let response = SmtpResponse::parse(&lines).map_err(|e| {
            self.broken = true;
            e
        })?;
        trace!(host = %self.host, code = response.code, "Received SMTP response");
        Ok(response)
    }

    async fn read_lines<R: AsyncBufRead + Unpin>(
        reader: &mut R,
        read_timeout: Duration,
    ) -> VerifyResult<Vec<String>> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let mut limited = (&mut *reader).take(MAX_LINE_LEN as u64);
            let read = timeout(read_timeout, limited.read_line(&mut line))
                .await
                .map_err(|_| VerifyError::timeout("Read timed out"))?
                .map_err(|e| VerifyError::connect(format!("Read error: {}", e)).with_cause(e))?;

            if read == 0 {
                return Err(VerifyError::connect("Server closed connection"));
            }
            if read >= MAX_LINE_LEN && !line.ends_with('\n') {
                return Err(VerifyError::protocol(format!(
                    "Reply line exceeds {} bytes",
                    MAX_LINE_LEN
                )));
            }

            let line = line.trim_end().to_string();
            let continued = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !continued {
                return Ok(lines);
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(VerifyError::protocol("Reply has too many lines"));
            }
        }
    }

    async fn write_all<W: AsyncWrite + Unpin>(
        writer: &mut W,
        data: &[u8],
        write_timeout: Duration,
    ) -> VerifyResult<()> {
        timeout(write_timeout, async {
            writer.write_all(data).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| VerifyError::timeout("Write timed out"))?
        .map_err(|e| VerifyError::connect(format!("Write error: {}", e)).with_cause(e))
    }

    /// Sends QUIT (best effort) and drops the socket. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.stream.is_some() && !self.broken {
            let _ = self.send_command(&SmtpCommand::Quit).await;
        }
        if let Some(stream) = self.stream.take() {
            let _ = match stream {
                TransportStream::Plain(mut s) => s.get_mut().shutdown().await,
                TransportStream::Tls(mut s) => s.get_mut().shutdown().await,
            };
        }
        self.state = ProbeState::Closed;
    }

    /// Starts recording a transcript, discarding any previous one.
    pub fn start_transcript(&mut self) {
        self.transcript = Some(Vec::new());
    }

    /// Stops recording and returns the transcript.
    pub fn take_transcript(&mut self) -> Vec<String> {
        self.transcript.take().unwrap_or_default()
    }

    fn record(&mut self, line: String) {
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.push(line);
        }
    }

    /// Returns true if the connection can carry another probe.
    pub fn is_usable(&self) -> bool {
        self.stream.is_some() && !self.broken && self.state.is_open()
    }

    /// Marks the connection as not reusable.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Refreshes the last-used timestamp.
    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Exchanger host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Exchanger port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current protocol state.
    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// True if STARTTLS was negotiated.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// True once EHLO/HELO has been accepted.
    pub fn is_greeted(&self) -> bool {
        self.helo_domain.is_some() && self.state.is_open()
    }

    /// HELO domain this connection greeted with.
    pub fn helo_domain(&self) -> Option<&str> {
        self.helo_domain.as_deref()
    }

    /// Capabilities from the last EHLO.
    pub fn capabilities(&self) -> Option<&EsmtpCapabilities> {
        self.capabilities.as_ref()
    }

    /// When the socket was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last time a reply was read or the connection was released.
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Time since last use.
    pub fn idle_time(&self) -> Duration {
        self.last_used_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockSmtpServer, ServerScript};

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_probe_exchange() {
        let server = MockSmtpServer::start(ServerScript::default().reject("ghost")).await.unwrap();
        let mut conn = SmtpConnection::connect("127.0.0.1", server.port(), SECOND, SECOND)
            .await
            .unwrap();
        assert_eq!(conn.state(), ProbeState::Connected);

        conn.start_transcript();
        let caps = conn.greet("probe.example.org").await.unwrap();
        assert!(!caps.starttls);
        assert!(!conn.starttls(StartTlsMode::Auto, false).await.unwrap());

        assert!(conn.mail_from("verify@example.org").await.unwrap().is_success());
        assert!(conn.rcpt_to("jane@example.net").await.unwrap().is_success());
        conn.mark_classified();

        conn.rset().await.unwrap();
        assert_eq!(conn.state(), ProbeState::Greeted);
        conn.mail_from("verify@example.org").await.unwrap();
        let reply = conn.rcpt_to("ghost@example.net").await.unwrap();
        assert_eq!(reply.code, 550);

        let transcript = conn.take_transcript();
        assert_eq!(transcript[0], "C: EHLO probe.example.org");
        assert!(transcript.iter().any(|l| l.starts_with("S: 550")));

        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state(), ProbeState::Closed);
        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn test_commands_fail_when_not_connected() {
        let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
        let mut conn = SmtpConnection::connect("127.0.0.1", server.port(), SECOND, SECOND)
            .await
            .unwrap();
        conn.close().await;

        let err = conn.send_command(&SmtpCommand::Noop).await.unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_starttls_required_but_missing() {
        let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
        let mut conn = SmtpConnection::connect("127.0.0.1", server.port(), SECOND, SECOND)
            .await
            .unwrap();
        conn.greet("probe.example.org").await.unwrap();

        let err = conn.starttls(StartTlsMode::On, false).await.unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::TlsUnavailable);
        assert!(!conn.starttls(StartTlsMode::Off, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_opportunistic_tls_accepts_self_signed_certificate() {
        let server = MockSmtpServer::start(ServerScript::default().accept_starttls()).await.unwrap();
        let mut conn = SmtpConnection::connect("127.0.0.1", server.port(), SECOND, SECOND)
            .await
            .unwrap();
        assert!(conn.greet("probe.example.org").await.unwrap().starttls);

        assert!(conn.starttls(StartTlsMode::Auto, false).await.unwrap());
        assert!(conn.is_tls());
        assert_eq!(conn.state(), ProbeState::Greeted);
        // Capabilities come from the EHLO sent over TLS
        assert!(!conn.capabilities().unwrap().starttls);

        assert!(conn.mail_from("verify@example.org").await.unwrap().is_success());
        assert!(conn.rcpt_to("jane@example.net").await.unwrap().is_success());
        conn.close().await;

        let ehlos = server.commands().iter().filter(|c| c.starts_with("EHLO")).count();
        assert_eq!(ehlos, 2);
    }

    #[tokio::test]
    async fn test_required_tls_checks_certificate() {
        let server = MockSmtpServer::start(ServerScript::default().accept_starttls()).await.unwrap();

        let mut conn = SmtpConnection::connect("127.0.0.1", server.port(), SECOND, SECOND)
            .await
            .unwrap();
        conn.greet("probe.example.org").await.unwrap();
        let err = conn.starttls(StartTlsMode::On, false).await.unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::TlsHandshake);
        assert!(!conn.is_usable());

        let mut conn = SmtpConnection::connect("127.0.0.1", server.port(), SECOND, SECOND)
            .await
            .unwrap();
        conn.greet("probe.example.org").await.unwrap();
        assert!(conn.starttls(StartTlsMode::On, true).await.unwrap());
        assert!(conn.is_tls());
    }

    #[tokio::test]
    async fn test_oversized_reply_line() {
        let banner = "x".repeat(MAX_LINE_LEN + 100);
        let server = MockSmtpServer::start(ServerScript::default().banner(220, &banner)).await.unwrap();
        let err = SmtpConnection::connect("127.0.0.1", server.port(), SECOND, SECOND)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = MockSmtpServer::unused_port().await.unwrap();
        let err = SmtpConnection::connect("127.0.0.1", port, SECOND, SECOND)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::SmtpConnect);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_banner_rejection() {
        let server = MockSmtpServer::start(ServerScript::default().banner(554, "No SMTP service here")).await.unwrap();
        let err = SmtpConnection::connect("127.0.0.1", server.port(), SECOND, SECOND)
            .await
            .unwrap_err();
        assert_eq!(err.smtp_code(), Some(554));
    }

    #[tokio::test]
    async fn test_read_timeout_marks_broken() {
        let server = MockSmtpServer::start(ServerScript::default().silent_after_banner()).await.unwrap();
        let mut conn = SmtpConnection::connect(
            "127.0.0.1",
            server.port(),
            SECOND,
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let err = conn.greet("probe.example.org").await.unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::SmtpTimeout);
        assert!(!conn.is_usable());
    }
}
