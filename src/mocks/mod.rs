//! Test doubles for the network edges.
//!
//! `MockMxLookup` answers MX queries from a script and counts lookups.
//! `MockSmtpServer` is a scripted SMTP listener on `127.0.0.1` that speaks
//! just enough of the protocol for probing: banner, EHLO/HELO, STARTTLS,
//! MAIL, RCPT, RSET, NOOP and QUIT. STARTTLS is either refused or completed
//! with a bundled self-signed certificate for `localhost` and `127.0.0.1`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::dns::MxLookup;
use crate::errors::{VerifyError, VerifyErrorKind, VerifyResult};
use crate::types::MxRecord;

const MOCK_CERT: &str = include_str!("mock_cert.pem");
const MOCK_KEY: &str = include_str!("mock_key.pem");

type ScriptedAnswer = Result<Vec<MxRecord>, (VerifyErrorKind, String)>;

/// Scripted MX lookup.
///
/// Domains without a script entry fail with `NoMxRecord`.
#[derive(Debug, Default)]
pub struct MockMxLookup {
    answers: HashMap<String, ScriptedAnswer>,
    lookups: Mutex<HashMap<String, usize>>,
}

impl MockMxLookup {
    /// Creates an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `domain` with the given records.
    pub fn with_records(mut self, domain: &str, records: Vec<MxRecord>) -> Self {
        self.answers.insert(domain.to_ascii_lowercase(), Ok(records));
        self
    }

    /// Answers `domain` with a single exchanger on `127.0.0.1:port`.
    pub fn with_local_server(self, domain: &str, port: u16) -> Self {
        self.with_records(domain, vec![MxRecord::new("127.0.0.1", 10, port)])
    }

    /// Fails lookups of `domain` with the given kind.
    pub fn with_failure(mut self, domain: &str, kind: VerifyErrorKind) -> Self {
        self.answers.insert(
            domain.to_ascii_lowercase(),
            Err((kind, format!("scripted failure for {}", domain))),
        );
        self
    }

    /// Number of lookups performed for `domain`.
    pub fn lookup_count(&self, domain: &str) -> usize {
        self.lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&domain.to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Number of lookups performed overall.
    pub fn total_lookups(&self) -> usize {
        self.lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

#[async_trait]
impl MxLookup for MockMxLookup {
    async fn lookup_mx(&self, domain: &str) -> VerifyResult<Vec<MxRecord>> {
        let domain = domain.to_ascii_lowercase();
        *self
            .lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(domain.clone())
            .or_insert(0) += 1;

        match self.answers.get(&domain) {
            Some(Ok(records)) => Ok(records.clone()),
            Some(Err((kind, message))) => Err(VerifyError::new(*kind, message.clone())),
            None => Err(VerifyError::no_mx(&domain)),
        }
    }
}

/// Behaviour of a `MockSmtpServer`.
#[derive(Debug, Clone)]
pub struct ServerScript {
    banner: (u16, String),
    starttls: bool,
    tls_accepted: bool,
    ehlo_supported: bool,
    silent_after_banner: bool,
    accept_unlisted: bool,
    accepted: HashSet<String>,
    rejected: HashSet<String>,
    greylisted: HashSet<String>,
    blocked: HashSet<String>,
    mail_reply: Option<(u16, String)>,
    rcpt_delay: Option<Duration>,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            banner: (220, "mock.local ESMTP ready".to_string()),
            starttls: false,
            tls_accepted: false,
            ehlo_supported: true,
            silent_after_banner: false,
            accept_unlisted: true,
            accepted: HashSet::new(),
            rejected: HashSet::new(),
            greylisted: HashSet::new(),
            blocked: HashSet::new(),
            mail_reply: None,
            rcpt_delay: None,
        }
    }
}

impl ServerScript {
    /// Replaces the banner.
    pub fn banner(mut self, code: u16, text: &str) -> Self {
        self.banner = (code, text.to_string());
        self
    }

    /// Advertises STARTTLS (and refuses it with 454 when asked).
    pub fn advertise_starttls(mut self) -> Self {
        self.starttls = true;
        self
    }

    /// Advertises STARTTLS and completes the handshake with the bundled
    /// self-signed certificate.
    pub fn accept_starttls(mut self) -> Self {
        self.starttls = true;
        self.tls_accepted = true;
        self
    }

    /// Answers EHLO with 502 so clients fall back to HELO.
    pub fn without_ehlo(mut self) -> Self {
        self.ehlo_supported = false;
        self
    }

    /// Sends the banner and then never answers.
    pub fn silent_after_banner(mut self) -> Self {
        self.silent_after_banner = true;
        self
    }

    /// Rejects RCPT for this local part with `550 5.1.1 User unknown`.
    pub fn reject(mut self, local: &str) -> Self {
        self.rejected.insert(local.to_ascii_lowercase());
        self
    }

    /// Answers RCPT for this local part with a greylisting 451.
    pub fn greylist(mut self, local: &str) -> Self {
        self.greylisted.insert(local.to_ascii_lowercase());
        self
    }

    /// Answers RCPT for this local part with a 554 reputation block.
    pub fn block(mut self, local: &str) -> Self {
        self.blocked.insert(local.to_ascii_lowercase());
        self
    }

    /// Accepts only the given local parts; everything else is unknown.
    pub fn only_accept<'a>(mut self, locals: impl IntoIterator<Item = &'a str>) -> Self {
        self.accept_unlisted = false;
        self.accepted = locals.into_iter().map(str::to_ascii_lowercase).collect();
        self
    }

    /// Answers MAIL FROM with the given reply.
    pub fn mail_reply(mut self, code: u16, text: &str) -> Self {
        self.mail_reply = Some((code, text.to_string()));
        self
    }

    /// Delays every RCPT reply.
    pub fn rcpt_delay(mut self, delay: Duration) -> Self {
        self.rcpt_delay = Some(delay);
        self
    }

    fn rcpt_reply(&self, local: &str) -> String {
        if self.greylisted.contains(local) {
            "451 4.7.1 Greylisted, try again later".to_string()
        } else if self.blocked.contains(local) {
            "554 5.7.1 Service unavailable; client host blocked using Spamhaus".to_string()
        } else if self.rejected.contains(local)
            || (!self.accept_unlisted && !self.accepted.contains(local))
        {
            "550 5.1.1 User unknown".to_string()
        } else {
            "250 2.1.5 Recipient OK".to_string()
        }
    }
}

/// Scripted SMTP server on a loopback port. Stops when dropped.
#[derive(Debug)]
pub struct MockSmtpServer {
    port: u16,
    connections: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl MockSmtpServer {
    /// Binds to an ephemeral port and starts serving `script`.
    pub async fn start(script: ServerScript) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let connections = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(script);

        let handle = {
            let connections = connections.clone();
            let commands = commands.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let script = script.clone();
                    let commands = commands.clone();
                    tokio::spawn(async move {
                        let _ = serve(socket, &script, &commands).await;
                    });
                }
            })
        };

        Ok(Self {
            port,
            connections,
            commands,
            handle,
        })
    }

    /// Returns a loopback port with nothing listening on it.
    pub async fn unused_port() -> io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr().map(|addr| addr.port())
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Commands received so far, across all connections.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// How a plain-text conversation ended.
enum SessionEnd {
    Closed,
    StartTls,
}

fn tls_acceptor() -> io::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut MOCK_CERT.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut MOCK_KEY.as_bytes())?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key in mock_key.pem"))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn serve(socket: TcpStream, script: &ServerScript, commands: &Mutex<Vec<String>>) -> io::Result<()> {
    let mut stream = BufReader::new(socket);

    let (code, text) = &script.banner;
    stream.write_all(format!("{} {}\r\n", code, text).as_bytes()).await?;
    if !(200..300).contains(code) {
        return Ok(());
    }
    if script.silent_after_banner {
        tokio::time::sleep(Duration::from_secs(30)).await;
        return Ok(());
    }

    if let SessionEnd::StartTls = converse(&mut stream, script, commands, false).await? {
        let tls = tls_acceptor()?.accept(stream.into_inner()).await?;
        converse(&mut BufReader::new(tls), script, commands, true).await?;
    }
    Ok(())
}

async fn converse<S>(
    stream: &mut BufReader<S>,
    script: &ServerScript,
    commands: &Mutex<Vec<String>>,
    encrypted: bool,
) -> io::Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offer_tls = script.starttls && !encrypted;
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(SessionEnd::Closed);
        }
        let command = line.trim_end().to_string();
        commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());

        let upper = command.to_ascii_uppercase();
        let reply = if upper.starts_with("EHLO") {
            if !script.ehlo_supported {
                "502 5.5.1 Command not implemented".to_string()
            } else if offer_tls {
                "250-mock.local\r\n250-PIPELINING\r\n250-STARTTLS\r\n250 ENHANCEDSTATUSCODES".to_string()
            } else {
                "250-mock.local\r\n250-PIPELINING\r\n250 ENHANCEDSTATUSCODES".to_string()
            }
        } else if upper.starts_with("HELO") {
            "250 mock.local".to_string()
        } else if upper.starts_with("STARTTLS") {
            if offer_tls && script.tls_accepted {
                stream.write_all(b"220 2.0.0 Ready to start TLS\r\n").await?;
                stream.flush().await?;
                return Ok(SessionEnd::StartTls);
            }
            "454 4.7.0 TLS not available".to_string()
        } else if upper.starts_with("MAIL FROM:") {
            match &script.mail_reply {
                Some((code, text)) => format!("{} {}", code, text),
                None => "250 2.1.0 Sender OK".to_string(),
            }
        } else if upper.starts_with("RCPT TO:") {
            if let Some(delay) = script.rcpt_delay {
                tokio::time::sleep(delay).await;
            }
            script.rcpt_reply(&recipient_local(&command))
        } else if upper.starts_with("RSET") || upper.starts_with("NOOP") {
            "250 2.0.0 OK".to_string()
        } else if upper.starts_with("QUIT") {
            stream.write_all(b"221 2.0.0 Bye\r\n").await?;
            stream.flush().await?;
            return Ok(SessionEnd::Closed);
        } else {
            "500 5.5.2 Command unrecognized".to_string()
        };

        stream.write_all(format!("{}\r\n", reply).as_bytes()).await?;
        stream.flush().await?;
    }
}

fn recipient_local(command: &str) -> String {
    let address = command
        .split_once(':')
        .map(|(_, rest)| rest.trim().trim_start_matches('<'))
        .unwrap_or_default();
    address
        .split('@')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lookup_counts() {
        let lookup = MockMxLookup::new()
            .with_local_server("example.org", 2525)
            .with_failure("broken.org", VerifyErrorKind::DnsLookup);

        let records = lookup.lookup_mx("Example.org").await.unwrap();
        assert_eq!(records[0].port, 2525);
        assert_eq!(
            lookup.lookup_mx("broken.org").await.unwrap_err().kind(),
            VerifyErrorKind::DnsLookup
        );
        assert_eq!(
            lookup.lookup_mx("missing.org").await.unwrap_err().kind(),
            VerifyErrorKind::NoMxRecord
        );
        assert_eq!(lookup.lookup_count("example.org"), 1);
        assert_eq!(lookup.total_lookups(), 3);
    }

    #[test]
    fn test_script_rcpt_replies() {
        let script = ServerScript::default().reject("ghost").greylist("slow").block("spam");
        assert!(script.rcpt_reply("jane").starts_with("250"));
        assert!(script.rcpt_reply("spam").starts_with("554"));
        assert!(script.rcpt_reply("ghost").starts_with("550"));
        assert!(script.rcpt_reply("slow").starts_with("451"));

        let strict = ServerScript::default().only_accept(["jane"]);
        assert!(strict.rcpt_reply("jane").starts_with("250"));
        assert!(strict.rcpt_reply("random").starts_with("550"));
    }

    #[test]
    fn test_bundled_certificate_loads() {
        assert!(tls_acceptor().is_ok());
    }

    #[test]
    fn test_recipient_local() {
        assert_eq!(recipient_local("RCPT TO:<Jane@Example.net>"), "jane");
        assert_eq!(recipient_local("RCPT TO: jane@example.net"), "jane");
    }
}
