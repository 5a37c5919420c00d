use std::{
    io::{BufReader, Cursor},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use quinn::{Connecting, VarInt};
use quinn_proto::ConnectionError;
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, RootCertStore, ServerName,
};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    error::Error,
    memory::MemoryCluster,
    wire::{FrameRecvStream, FrameSendStream},
    CloseCause, Command, Connection, Connector, Event, CLOSE_ADMINISTRATIVE, CLOSE_IO,
    CLOSE_OPERATOR,
};

/// Server name clients present when none is configured. Generated node
/// certificates are issued for it.
pub const DEFAULT_SERVER_NAME: &str = "localhost";

/// A node's certificate chain and key.
pub struct NodeTls {
    cert_chain: Vec<Certificate>,
    key: PrivateKey,
}

impl NodeTls {
    /// Generates a self-signed certificate for the given names.
    pub fn self_signed(names: Vec<String>) -> Result<Self, Error> {
        let cert = rcgen::generate_simple_self_signed(names)?;
        Ok(Self {
            cert_chain: vec![Certificate(cert.serialize_der()?)],
            key: PrivateKey(cert.serialize_private_key_der()),
        })
    }

    /// Loads a PEM certificate chain and a PKCS#8 PEM key.
    pub fn from_pem(cert: &[u8], key: &[u8]) -> Result<Self, Error> {
        let cert_chain: Vec<Certificate> =
            rustls_pemfile::certs(&mut BufReader::new(Cursor::new(cert)))?
                .into_iter()
                .map(Certificate)
                .collect();
        if cert_chain.is_empty() {
            Err(Error::MissingPemItem("certificate"))?
        }
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(Cursor::new(key)))?;
        if keys.is_empty() {
            Err(Error::MissingPemItem("private key"))?
        }
        Ok(Self {
            cert_chain,
            key: PrivateKey(keys.remove(0)),
        })
    }

    /// The node's own certificate, for clients that pin it.
    pub fn certificate(&self) -> &Certificate {
        &self.cert_chain[0]
    }
}

/// How a client decides to trust a node.
pub enum Trust {
    /// Only certificates chaining to these roots.
    Roots(Vec<Certificate>),
    /// Any certificate. Links are still encrypted but not authenticated.
    AnyNode,
}

impl Trust {
    /// Loads trusted roots from a PEM file's contents.
    pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
        let roots: Vec<Certificate> = rustls_pemfile::certs(&mut BufReader::new(Cursor::new(pem)))?
            .into_iter()
            .map(Certificate)
            .collect();
        if roots.is_empty() {
            Err(Error::MissingPemItem("certificate"))?
        }
        Ok(Trust::Roots(roots))
    }
}

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport_config = quinn::TransportConfig::default();
    transport_config.keep_alive_interval(Some(Duration::from_secs(1)));
    Arc::new(transport_config)
}

/// A broker node reachable over QUIC. Every accepted connection opens one
/// bidirectional stream, which is bridged onto a link of the in-process
/// cluster.
pub struct BrokerEndpoint {
    ep: quinn::Endpoint,
}

impl BrokerEndpoint {
    pub fn bind(addr: SocketAddr, tls: &NodeTls) -> Result<Self, Error> {
        let mut server_config =
            quinn::ServerConfig::with_single_cert(tls.cert_chain.clone(), tls.key.clone())?;
        server_config.transport_config(transport_config());
        let ep = quinn::Endpoint::server(server_config, addr)?;
        Ok(Self { ep })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.ep.local_addr()?)
    }

    /// Accepts links until `shutdown` is cancelled. `node` is the cluster
    /// node the links attach to.
    /// Clients see the shutdown as an administrative close and move on to
    /// another node.
    pub async fn serve(
        self,
        cluster: MemoryCluster,
        node: SocketAddr,
        shutdown: CancellationToken,
    ) {
        info!("node {} listening on {:?}", node, self.ep.local_addr().ok());
        loop {
            select! {
                _ = shutdown.cancelled() => {
                    self.ep.close(VarInt::from_u32(CLOSE_ADMINISTRATIVE), b"node shutting down");
                    break;
                }
                incoming = self.ep.accept() => {
                    let Some(in_progress) = incoming else {
                        break;
                    };
                    let cluster = cluster.clone();
                    let remote = in_progress.remote_address();
                    let span = debug_span!("link", remote = %remote, node = %node);
                    tokio::spawn(async move {
                        if let Err(e) = Self::bridge(cluster, node, in_progress).await {
                            debug!("link ended: {}", e);
                        }
                    }.instrument(span));
                }
            }
        }
        self.ep.wait_idle().await;
        debug!("node {} stopped", node);
    }

    async fn bridge(
        cluster: MemoryCluster,
        node: SocketAddr,
        in_progress: Connecting,
    ) -> Result<(), Error> {
        let conn = in_progress.await?;
        debug!("connected via QUIC");
        let (raw_tx, raw_rx) = conn.accept_bi().await?;
        let mut tx = FrameSendStream::new(raw_tx);
        let rx = FrameRecvStream::new(raw_rx);

        let mut link = match cluster.connect(node).await {
            Ok(link) => link,
            Err(e) => {
                let cause = CloseCause::Io(e.to_string());
                conn.close(VarInt::from_u32(cause.code()), cause.reason().as_bytes());
                Err(e)?
            }
        };

        let (commands_tx, mut commands) = mpsc::unbounded_channel();
        tokio::spawn(Self::read_commands(rx, commands_tx).in_current_span());

        loop {
            select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        link.close();
                        break;
                    };
                    if command == Command::Close {
                        link.close();
                        conn.close(VarInt::from_u32(CLOSE_OPERATOR), b"closed by client");
                        break;
                    }
                    if link.submit(command).is_err() {
                        break;
                    }
                }
                event = link.next_event() => {
                    match event {
                        Some(Event::Closed(cause)) => {
                            let _ = tx.send(&Event::Closed(cause.clone()).encode()?).await;
                            let _ = tx.finish().await;
                            conn.close(VarInt::from_u32(cause.code()), cause.reason().as_bytes());
                            break;
                        }
                        Some(event) => tx.send(&event.encode()?).await?,
                        None => {
                            conn.close(VarInt::from_u32(CLOSE_IO), b"link ended");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Decodes frames off the client's stream. Ends, closing the channel,
    /// when the stream does.
    async fn read_commands(mut rx: FrameRecvStream, commands: mpsc::UnboundedSender<Command>) {
        loop {
            match rx.recv().await.and_then(|buf| Command::decode(&buf)) {
                Ok(command) => {
                    if commands.send(command).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("client stream ended: {}", e);
                    return;
                }
            }
        }
    }
}

/// Opens links to `sequin node` processes over QUIC.
pub struct QuicConnector {
    ep: quinn::Endpoint,
    server_name: String,
}

impl QuicConnector {
    pub fn new(trust: Trust, server_name: impl Into<String>) -> Result<Self, Error> {
        let crypto = Self::tls_config(trust)?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(transport_config());
        let mut ep = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        ep.set_default_client_config(client_config);
        Ok(Self {
            ep,
            server_name: server_name.into(),
        })
    }

    fn tls_config(trust: Trust) -> Result<rustls::ClientConfig, Error> {
        let builder = rustls::ClientConfig::builder().with_safe_defaults();
        let config = match trust {
            Trust::Roots(certs) => {
                let mut roots = RootCertStore::empty();
                for cert in &certs {
                    roots.add(cert)?;
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            Trust::AnyNode => {
                warn!("node certificates will not be verified");
                builder
                    .with_custom_certificate_verifier(Arc::new(AnyNodeCertificate))
                    .with_no_client_auth()
            }
        };
        Ok(config)
    }

    /// Forwards queued commands onto the stream. Dropping the connection's
    /// command sender closes the link as an operator close.
    async fn write_commands(
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut tx: FrameSendStream,
        conn: quinn::Connection,
    ) {
        while let Some(command) = commands.recv().await {
            let closing = command == Command::Close;
            let sent = match command.encode() {
                Ok(frame) => tx.send(&frame).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                debug!("could not send command: {}", e);
                return;
            }
            if closing {
                let _ = tx.finish().await;
                break;
            }
        }
        conn.close(VarInt::from_u32(CLOSE_OPERATOR), b"closed by client");
    }

    /// Forwards frames from the stream as events, ending with exactly one
    /// `Closed` event.
    async fn read_events(
        mut rx: FrameRecvStream,
        events: mpsc::UnboundedSender<Event>,
        conn: quinn::Connection,
    ) {
        loop {
            let event = match rx.recv().await.and_then(|buf| Event::decode(&buf)) {
                Ok(event) => event,
                Err(Error::CouldNotDecodeFrame) => {
                    warn!("undecodable frame from broker, dropping link");
                    conn.close(VarInt::from_u32(CLOSE_IO), b"undecodable frame");
                    let _ = events.send(Event::Closed(CloseCause::Io("undecodable frame".into())));
                    return;
                }
                Err(e) => {
                    let cause = Self::close_cause(&conn, &e);
                    debug!("link ended: {}", cause);
                    let _ = events.send(Event::Closed(cause));
                    return;
                }
            };
            let last = matches!(event, Event::Closed(_));
            if events.send(event).is_err() || last {
                return;
            }
        }
    }

    /// Works out why a link failed from the QUIC connection's close reason.
    fn close_cause(conn: &quinn::Connection, error: &Error) -> CloseCause {
        match conn.close_reason() {
            Some(ConnectionError::ApplicationClosed(close)) => {
                let code = u32::try_from(close.error_code.into_inner()).unwrap_or(u32::MAX);
                CloseCause::from_code(code, String::from_utf8_lossy(&close.reason).into_owned())
            }
            Some(ConnectionError::LocallyClosed) => CloseCause::Operator,
            Some(other) => CloseCause::Io(other.to_string()),
            None => CloseCause::Io(error.to_string()),
        }
    }
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self, addr: SocketAddr) -> Result<Connection, Error> {
        let span = debug_span!("quic_link", remote = %addr);
        async move {
            debug!("establishing QUIC connection");
            let conn = self.ep.connect(addr, &self.server_name)?.await?;
            debug!("connected via QUIC, opening stream");
            let (raw_tx, raw_rx) = conn.open_bi().await?;

            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            tokio::spawn(
                Self::write_commands(commands_rx, FrameSendStream::new(raw_tx), conn.clone())
                    .in_current_span(),
            );
            tokio::spawn(
                Self::read_events(FrameRecvStream::new(raw_rx), events_tx, conn).in_current_span(),
            );
            Ok(Connection::new(addr, commands_tx, events_rx))
        }
        .instrument(span)
        .await
    }
}

/// Accepts whatever certificate a node presents.
struct AnyNodeCertificate;

impl ServerCertVerifier for AnyNodeCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
