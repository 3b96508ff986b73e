//! IRC connection driver.
//!
//! One task per connection owns the socket, the [`FlowController`] and the
//! [`LagMonitor`]. It decodes inbound lines into [`Event`]s in arrival order
//! and writes outbound commands after they clear the flow gates. Consumers
//! talk to it through a cloneable [`ClientHandle`].
//!
//! Supports both plaintext and TLS connections. Reconnection is not handled
//! here; the runtime supervisor creates a fresh driver per attempt.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use crate::ctcp::{self, Ctcp};
use crate::error::SendError;
use crate::event::Event;
use crate::flow::{FlowConfig, FlowController, FlowStats, Ready, Reply};
use crate::irc::Message;
use crate::lag::{self, LagConfig, LagMonitor};

/// Capabilities requested when the server offers them.
const WANTED_CAPS: [&str; 5] = [
    "echo-message",
    "server-time",
    "message-tags",
    "away-notify",
    "batch",
];

/// Nick-in-use retries before giving up on registration.
const MAX_NICK_TRIES: u32 = 5;

/// Configuration for connecting to an IRC server.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Desired nickname.
    pub nick: String,
    /// Username (ident).
    pub user: String,
    /// Real name.
    pub realname: String,
    /// Use TLS.
    pub tls: bool,
    /// Skip TLS certificate verification (for self-signed certs).
    pub tls_insecure: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            nick: "skein".to_string(),
            user: "skein".to_string(),
            realname: "skein".to_string(),
            tls: false,
            tls_insecure: false,
        }
    }
}

/// Commands the consumer can send to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join(String),
    Part {
        channel: String,
        reason: Option<String>,
    },
    Privmsg {
        target: String,
        text: String,
    },
    Notice {
        target: String,
        text: String,
    },
    Raw(String),
    Quit(Option<String>),
}

/// Cut at the first CR or LF so one command is always one line.
fn single_line(s: &str) -> &str {
    s.split(['\r', '\n']).next().unwrap_or("")
}

impl Command {
    /// Wire form without CRLF.
    pub fn to_line(&self) -> String {
        match self {
            Command::Join(channel) => format!("JOIN {}", single_line(channel)),
            Command::Part { channel, reason } => match reason {
                Some(r) => format!("PART {} :{}", single_line(channel), single_line(r)),
                None => format!("PART {}", single_line(channel)),
            },
            Command::Privmsg { target, text } => {
                format!("PRIVMSG {} :{}", single_line(target), single_line(text))
            }
            Command::Notice { target, text } => {
                format!("NOTICE {} :{}", single_line(target), single_line(text))
            }
            Command::Raw(line) => single_line(line).to_string(),
            Command::Quit(Some(m)) => format!("QUIT :{}", single_line(m)),
            Command::Quit(None) => "QUIT".to_string(),
        }
    }
}

#[derive(Debug)]
struct Request {
    cmd: Command,
    reply: Reply,
}

/// A handle to a running IRC client connection.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Request>,
    stats: Arc<Mutex<FlowStats>>,
}

impl ClientHandle {
    /// Queue `cmd` and wait until it is written, delayed by flood
    /// protection, or rejected.
    pub async fn send(&self, cmd: Command) -> Result<(), SendError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Request {
                cmd,
                reply: Some(tx),
            })
            .await
            .map_err(|_| SendError::ConnectionClosed)?;
        rx.await.unwrap_or(Err(SendError::ConnectionClosed))
    }

    /// Queue `cmd` without waiting for the outcome. Usable from synchronous
    /// callbacks.
    pub fn try_send(&self, cmd: Command) -> Result<(), SendError> {
        self.cmd_tx
            .try_send(Request { cmd, reply: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::ConnectionClosed,
            })
    }

    pub async fn join(&self, channel: &str) -> Result<(), SendError> {
        self.send(Command::Join(channel.to_string())).await
    }

    pub async fn part(&self, channel: &str, reason: Option<&str>) -> Result<(), SendError> {
        self.send(Command::Part {
            channel: channel.to_string(),
            reason: reason.map(str::to_string),
        })
        .await
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<(), SendError> {
        self.send(Command::Privmsg {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn notice(&self, target: &str, text: &str) -> Result<(), SendError> {
        self.send(Command::Notice {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    /// `/me` action.
    pub async fn action(&self, target: &str, text: &str) -> Result<(), SendError> {
        self.privmsg(target, &ctcp::encode("ACTION", Some(text))).await
    }

    /// CTCP request (sent as PRIVMSG).
    pub async fn ctcp(&self, target: &str, verb: &str, params: Option<&str>) -> Result<(), SendError> {
        self.privmsg(target, &ctcp::encode(verb, params)).await
    }

    pub async fn raw(&self, line: &str) -> Result<(), SendError> {
        self.send(Command::Raw(line.to_string())).await
    }

    /// QUIT bypasses flow control.
    pub async fn quit(&self, message: Option<&str>) -> Result<(), SendError> {
        self.send(Command::Quit(message.map(str::to_string))).await
    }

    /// Snapshot of this connection's counters.
    pub fn stats(&self) -> FlowStats {
        self.stats.lock().clone()
    }

    /// True once the driver task has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Establish TCP (and optionally TLS) connection to the server.
///
/// Returns the established connection for `connect_with_stream` to use, so
/// connection errors surface before any driver task is spawned.
pub async fn establish_connection(config: &ConnectConfig) -> Result<EstablishedConnection> {
    // Auto-detect TLS from port if not explicitly set
    let use_tls = config.tls || config.server_addr.ends_with(":6697");
    let mode = if use_tls { "TLS" } else { "plain" };

    tracing::debug!("Resolving {}...", config.server_addr);
    let tcp = TcpStream::connect(&config.server_addr)
        .await
        .map_err(|e| anyhow::anyhow!("TCP connect to {} failed: {e}", config.server_addr))?;
    tracing::debug!("TCP connected to {} ({mode})", config.server_addr);

    if use_tls {
        let tls_config = if config.tls_insecure {
            tracing::debug!("TLS: insecure mode (skipping cert verification)");
            rustls_insecure_config()
        } else {
            rustls_default_config()
        };
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = config
            .server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&config.server_addr);
        let dns_name = rustls::pki_types::ServerName::try_from(server_name.to_string())?;
        let tls_stream = connector
            .connect(dns_name, tcp)
            .await
            .map_err(|e| anyhow::anyhow!("TLS handshake with {} failed: {e}", config.server_addr))?;
        tracing::debug!("TLS handshake complete");
        Ok(EstablishedConnection::Tls(Box::new(tls_stream)))
    } else {
        Ok(EstablishedConnection::Plain(tcp))
    }
}

/// A connection that has completed TCP (and optionally TLS) but hasn't
/// started IRC registration yet.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Start the protocol driver on an established connection.
pub fn connect_with_stream(
    conn: EstablishedConnection,
    config: ConnectConfig,
    flow: FlowConfig,
    lag: LagConfig,
) -> (ClientHandle, mpsc::Receiver<Event>) {
    match conn {
        EstablishedConnection::Plain(tcp) => connect_with_io(tcp, config, flow, lag),
        EstablishedConnection::Tls(tls) => connect_with_io(*tls, config, flow, lag),
    }
}

/// Start the protocol driver on any byte stream.
///
/// Returns a handle for sending commands and a receiver for events. The
/// protocol runs in a spawned task; the last event is always exactly one
/// [`Event::Disconnected`].
pub fn connect_with_io<S>(
    stream: S,
    config: ConnectConfig,
    flow: FlowConfig,
    lag: LagConfig,
) -> (ClientHandle, mpsc::Receiver<Event>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::channel(4096);
    let (cmd_tx, mut cmd_rx) = mpsc::channel(256);

    let mut flow = FlowController::new(flow);
    let handle = ClientHandle {
        cmd_tx,
        stats: flow.stats_handle(),
    };

    tokio::spawn(async move {
        let _ = event_tx.send(Event::Connected).await;
        let (reader, writer) = tokio::io::split(stream);
        let mut driver = Driver {
            writer,
            config: &config,
            flow: &mut flow,
            lag: LagMonitor::new(lag),
            event_tx: &event_tx,
            pending: Vec::new(),
            registered: false,
            nick: config.nick.clone(),
            echo_acked: false,
            quit_sent: false,
        };
        let reason = match driver.run(BufReader::new(reader), &mut cmd_rx).await {
            Ok(reason) => reason,
            Err(e) => e.to_string(),
        };
        for req in driver.pending.drain(..) {
            reply(req.reply, Err(SendError::ConnectionClosed));
        }
        drop(driver);

        flow.drain(SendError::ConnectionClosed);
        cmd_rx.close();
        while let Ok(req) = cmd_rx.try_recv() {
            reply(req.reply, Err(SendError::ConnectionClosed));
        }
        tracing::debug!(server = %config.server_addr, %reason, "Connection closed");
        let _ = event_tx.send(Event::Disconnected { reason }).await;
    });

    (handle, event_rx)
}

/// Decode one inbound line without its line ending. Invalid UTF-8 is read
/// as Latin-1, which maps every byte to a char.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes
        .strip_suffix(b"\n")
        .map(|b| b.strip_suffix(b"\r").unwrap_or(b))
        .unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

fn reply(tx: Reply, result: Result<(), SendError>) {
    if let Some(tx) = tx {
        let _ = tx.send(result);
    }
}

fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn rustls_insecure_config() -> rustls::ClientConfig {
    install_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

/// Per-connection protocol state.
struct Driver<'a, W> {
    writer: W,
    config: &'a ConnectConfig,
    flow: &'a mut FlowController,
    lag: LagMonitor,
    event_tx: &'a mpsc::Sender<Event>,
    /// Commands issued before `001`.
    pending: Vec<Request>,
    registered: bool,
    nick: String,
    echo_acked: bool,
    quit_sent: bool,
}

impl<W: AsyncWrite + Unpin> Driver<'_, W> {
    /// Run until the connection ends. Returns the disconnect reason.
    async fn run<R>(&mut self, mut reader: R, cmd_rx: &mut mpsc::Receiver<Request>) -> Result<String>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        self.write(b"CAP LS 302").await?;
        let nick_line = format!("NICK {}", self.config.nick);
        self.write(nick_line.as_bytes()).await?;
        let user_line = format!("USER {} 0 * :{}", self.config.user, self.config.realname);
        self.write(user_line.as_bytes()).await?;

        let mut nick_tries: u32 = 0;
        let mut offered_caps: Vec<String> = Vec::new();
        // Bytes of a partly read line survive a losing `select!` branch.
        let mut line_buf: Vec<u8> = Vec::new();
        let mut last_activity = Instant::now();
        let idle_timeout = self.lag.config().idle_timeout();
        let interval = self.lag.config().interval();
        let mut lag_timer = tokio::time::interval_at(Instant::now() + interval, interval);
        lag_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.flow.next_retry_at();
            tokio::select! {
                result = reader.read_until(b'\n', &mut line_buf) => {
                    if result? == 0 {
                        return Ok(if self.quit_sent { "Quit" } else { "EOF" }.to_string());
                    }
                    last_activity = Instant::now();
                    self.flow.record_inbound(line_buf.len());
                    let raw = decode_line(&line_buf);
                    line_buf.clear();
                    self.emit(Event::RawLine(raw.clone())).await;

                    let Some(msg) = Message::parse(&raw) else {
                        tracing::debug!(line = %raw, "Dropping malformed line");
                        continue;
                    };
                    match msg.command.as_str() {
                        // ERR_NICKNAMEINUSE
                        "433" if !self.registered => {
                            nick_tries += 1;
                            if nick_tries > MAX_NICK_TRIES {
                                return Ok("Nick in use".to_string());
                            }
                            let alt = format!("{}{}", self.config.nick, nick_tries);
                            let line = format!("NICK {alt}");
                            self.write(line.as_bytes()).await?;
                        }
                        "CAP" => self.handle_cap(&msg, &mut offered_caps).await?,
                        "001" => {
                            let nick = msg.params.first().cloned().unwrap_or_default();
                            self.nick = nick.clone();
                            self.registered = true;
                            self.lag.reset();
                            self.flow.reset();
                            self.emit(Event::Registered { nick }).await;
                            let queued = std::mem::take(&mut self.pending);
                            for req in queued {
                                self.submit(req).await?;
                            }
                        }
                        "ERROR" => {
                            let text = msg.params.last().cloned().unwrap_or_default();
                            self.emit(Event::ServerNotice { text: text.clone() }).await;
                            return Ok(text);
                        }
                        _ => self.handle_message(msg).await?,
                    }
                }
                Some(req) = cmd_rx.recv() => {
                    match req.cmd {
                        Command::Quit(_) => {
                            let line = req.cmd.to_line();
                            self.flow.record_bypass(&line);
                            let written = self.write(line.as_bytes()).await;
                            reply(req.reply, written.as_ref().map(|_| ()).map_err(|_| SendError::ConnectionClosed));
                            written?;
                            self.quit_sent = true;
                            if !self.registered {
                                return Ok("Quit".to_string());
                            }
                        }
                        _ if !self.registered => self.pending.push(req),
                        _ => self.submit(req).await?,
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    for ready in self.flow.poll_retries(Instant::now()) {
                        self.write_ready(ready).await?;
                    }
                }
                _ = lag_timer.tick(), if self.registered && self.lag.is_enabled() => {
                    let tick = self.lag.tick(lag::now_ms(), &self.nick);
                    if let Some(report) = tick.timed_out {
                        tracing::warn!(server = %self.config.server_addr, lag_ms = report.lag_ms, "Ping timed out");
                        self.emit(Event::Lag(report)).await;
                    }
                    if let Some(line) = tick.line {
                        self.flow.record_bypass(&line);
                        self.write(line.as_bytes()).await?;
                    }
                }
                _ = tokio::time::sleep_until(last_activity + idle_timeout) => {
                    return Ok("Ping timeout".to_string());
                }
            }
        }
    }

    async fn handle_cap(&mut self, msg: &Message, offered: &mut Vec<String>) -> Result<()> {
        let subcmd = msg.params.get(1).map(|s| s.to_ascii_uppercase());
        match subcmd.as_deref() {
            Some("LS") => {
                // `CAP * LS * :caps...` marks a continuation line.
                let more = msg.params.len() > 3 && msg.params[2] == "*";
                let caps = msg.params.last().map(|s| s.as_str()).unwrap_or("");
                offered.extend(
                    caps.split_whitespace()
                        .map(|c| c.split('=').next().unwrap_or(c).to_string()),
                );
                if more {
                    return Ok(());
                }
                let req: Vec<&str> = WANTED_CAPS
                    .iter()
                    .copied()
                    .filter(|c| offered.iter().any(|o| o == c))
                    .collect();
                if req.is_empty() {
                    self.write(b"CAP END").await?;
                } else {
                    let line = format!("CAP REQ :{}", req.join(" "));
                    self.write(line.as_bytes()).await?;
                }
            }
            Some("ACK") => {
                let caps = msg.params.last().map(|s| s.as_str()).unwrap_or("");
                self.echo_acked = caps.split_whitespace().any(|c| c == "echo-message");
                tracing::debug!(caps, "Capabilities acknowledged");
                self.write(b"CAP END").await?;
            }
            Some("NAK") => {
                self.write(b"CAP END").await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: Message) -> Result<()> {
        let nick = msg.nick().unwrap_or("").to_string();
        match msg.command.as_str() {
            "PING" => {
                let token = msg.params.last().map(|s| s.as_str()).unwrap_or("");
                let line = format!("PONG :{token}");
                self.flow.record_bypass(&line);
                self.write(line.as_bytes()).await?;
            }
            "PONG" => {
                let token = msg.params.last().map(|s| s.as_str()).unwrap_or("");
                if let Some(report) = self.lag.on_pong(token, lag::now_ms()) {
                    self.emit(Event::Lag(report)).await;
                }
            }
            "JOIN" => {
                let channel = msg.params.first().cloned().unwrap_or_default();
                self.emit(Event::Joined { channel, nick }).await;
            }
            "PART" => {
                let channel = msg.params.first().cloned().unwrap_or_default();
                let reason = msg.params.get(1).cloned();
                self.emit(Event::Parted { channel, nick, reason }).await;
            }
            "KICK" if msg.params.len() >= 2 => {
                let by = if nick.is_empty() { "server".to_string() } else { nick };
                self.emit(Event::Kicked {
                    channel: msg.params[0].clone(),
                    nick: msg.params[1].clone(),
                    by,
                    reason: msg.params.get(2).cloned().unwrap_or_default(),
                })
                .await;
            }
            "NICK" => {
                let new_nick = msg.params.first().cloned().unwrap_or_default();
                if !nick.is_empty() && !new_nick.is_empty() {
                    if nick.eq_ignore_ascii_case(&self.nick) {
                        self.nick = new_nick.clone();
                    }
                    self.emit(Event::NickChanged {
                        old_nick: nick,
                        new_nick,
                    })
                    .await;
                }
            }
            "TOPIC" => {
                if let Some(channel) = msg.params.first() {
                    self.emit(Event::TopicChanged {
                        channel: channel.clone(),
                        topic: msg.params.get(1).cloned().unwrap_or_default(),
                        set_by: Some(nick).filter(|n| !n.is_empty()),
                    })
                    .await;
                }
            }
            // RPL_TOPIC
            "332" if msg.params.len() >= 3 => {
                self.emit(Event::TopicChanged {
                    channel: msg.params[1].clone(),
                    topic: msg.params[2].clone(),
                    set_by: None,
                })
                .await;
            }
            "QUIT" => {
                let reason = msg.params.first().cloned().unwrap_or_default();
                self.emit(Event::UserQuit { nick, reason }).await;
            }
            "PRIVMSG" | "NOTICE" if msg.params.len() >= 2 => {
                let target = msg.params[0].clone();
                let text = msg.params[1].clone();
                if self.is_lag_reply(&nick, &text) {
                    return Ok(());
                }
                if msg.command == "PRIVMSG" {
                    self.emit(Event::Message {
                        from: nick,
                        target,
                        text,
                        tags: msg.tags,
                    })
                    .await;
                } else {
                    let from = msg.nick().map(str::to_string);
                    self.emit(Event::Notice {
                        from,
                        target,
                        text,
                        tags: msg.tags,
                    })
                    .await;
                }
            }
            // Names replies and end-of-lists carry nothing to show.
            "353" | "366" | "333" | "315" | "318" => {}
            cmd if cmd.len() == 3 && cmd.bytes().all(|b| b.is_ascii_digit()) => {
                let text = if msg.params.len() > 1 {
                    msg.params[1..].join(" ")
                } else {
                    msg.params.join(" ")
                };
                self.emit(Event::ServerNotice { text }).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Our own CTCP lag ping coming back, either as the echoed PRIVMSG or a
    /// NOTICE reply.
    fn is_lag_reply(&mut self, from: &str, text: &str) -> bool {
        if !from.eq_ignore_ascii_case(&self.nick) {
            return false;
        }
        let Some(c) = Ctcp::parse(text).filter(|c| c.is("PING")) else {
            return false;
        };
        let Some(token) = c.params.filter(|t| t.starts_with(lag::TOKEN_PREFIX)) else {
            return false;
        };
        if let Some(report) = self.lag.on_pong(token, lag::now_ms()) {
            let _ = self.event_tx.try_send(Event::Lag(report));
        }
        true
    }

    /// Run a command through the flow gates and write it if it passes.
    async fn submit(&mut self, req: Request) -> Result<()> {
        let line = req.cmd.to_line();
        if let Some(ready) = self.flow.submit(Instant::now(), line, req.reply) {
            self.write_ready(ready).await?;
        }
        Ok(())
    }

    async fn write_ready(&mut self, ready: Ready) -> Result<()> {
        match self.write(ready.line.as_bytes()).await {
            Ok(()) => {
                if !self.echo_acked {
                    self.local_echo(&ready.line).await;
                }
                ready.complete(Ok(()));
                Ok(())
            }
            Err(e) => {
                ready.complete(Err(SendError::ConnectionClosed));
                Err(e)
            }
        }
    }

    /// Without `echo-message` the server won't reflect our PRIVMSG/NOTICE,
    /// so synthesize the event.
    async fn local_echo(&mut self, line: &str) {
        let Some(msg) = Message::parse(line) else {
            return;
        };
        if msg.params.len() < 2 {
            return;
        }
        let target = msg.params[0].clone();
        let text = msg.params[1].clone();
        let event = match msg.command.as_str() {
            "PRIVMSG" => Event::Message {
                from: self.nick.clone(),
                target,
                text,
                tags: Default::default(),
            },
            "NOTICE" => Event::Notice {
                from: Some(self.nick.clone()),
                target,
                text,
                tags: Default::default(),
            },
            _ => return,
        };
        self.emit(event).await;
    }

    async fn emit(&mut self, event: Event) {
        let _ = self.event_tx.send(event).await;
    }

    async fn write(&mut self, line: &[u8]) -> Result<()> {
        self.writer.write_all(line).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}
