// SPDX-License-Identifier: MIT
// Server/connect factory (C8): owns the TLS listener/connector and assembles a
// `Connection` from an accepted or dialed stream (spec §4.8).

use crate::channel::FramedChannel;
use crate::config::Idscp2Configuration;
use crate::connection::{Connection, ConnectionCallbacks};
use crate::dat::DatProvider;
use crate::error::{Idscp2Error, Idscp2Result};
use crate::fsm::{Fsm, FsmChannelListener, FsmContext, Role};
use crate::ra::RaDriverRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, instrument};

/// Shared, constructor-injected dependencies every accepted or dialed connection needs
/// (spec §9 Open Question: no ambient/global registry — see DESIGN.md).
#[derive(Clone)]
pub struct Idscp2Deps {
    pub ra_registry: Arc<RaDriverRegistry>,
    pub dat_provider: Arc<DatProvider>,
    pub config: Arc<Idscp2Configuration>,
}

pub struct Idscp2Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    deps: Idscp2Deps,
}

impl Idscp2Server {
    pub async fn bind(addr: SocketAddr, tls_config: Arc<ServerConfig>, deps: Idscp2Deps) -> Idscp2Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "idscp2 server listening");
        Ok(Idscp2Server {
            listener,
            acceptor: TlsAcceptor::from(tls_config),
            deps,
        })
    }

    pub fn local_addr(&self) -> Idscp2Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one inbound TCP connection, completes the TLS handshake, and drives the
    /// IDSCP2 handshake to completion before returning the `Connection`.
    #[instrument(skip(self))]
    pub async fn accept(&self) -> Idscp2Result<Connection> {
        let (tcp, peer_addr) = self.listener.accept().await?;
        tcp.set_nodelay(true).ok();
        let tls_stream = self.acceptor.accept(tcp).await?;
        establish(tls_stream, peer_addr.to_string(), Role::Server, self.deps.clone()).await
    }
}

/// Dials `addr`, completes the TLS handshake as a client, and drives the IDSCP2
/// handshake to completion before returning the `Connection`.
#[instrument(skip(tls_config, deps))]
pub async fn connect(
    addr: SocketAddr,
    server_name: ServerName<'static>,
    tls_config: Arc<ClientConfig>,
    deps: Idscp2Deps,
) -> Idscp2Result<Connection> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true).ok();
    let connector = TlsConnector::from(tls_config);
    let tls_stream = connector.connect(server_name, tcp).await?;
    establish(tls_stream, addr.to_string(), Role::Client, deps).await
}

async fn establish<S>(tls_stream: S, remote_peer: String, role: Role, deps: Idscp2Deps) -> Idscp2Result<Connection>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + PeerCertificate + 'static,
{
    let peer_cert_der = tls_stream.peer_leaf_certificate_der();
    let (read_half, write_half) = tokio::io::split(tls_stream);
    let channel = FramedChannel::spawn(read_half, write_half, remote_peer.clone());

    let (callbacks, ready_rx) = ConnectionCallbacks::new();
    let ctx = FsmContext {
        channel: channel.clone(),
        config: deps.config.clone(),
        dat_provider: deps.dat_provider.clone(),
        ra_registry: deps.ra_registry.clone(),
        callbacks: callbacks.clone(),
        peer_cert_der,
        role,
    };
    let fsm = Fsm::new(ctx);
    channel.bind_fsm(Arc::new(FsmChannelListener(fsm.clone())));

    fsm.start().await;

    let handshake_timeout = deps.config.handshake_timeout();
    match tokio::time::timeout(handshake_timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => Ok(Connection::new(fsm, callbacks, remote_peer)),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => Err(Idscp2Error::HandshakeFailed("FSM dropped before completing handshake".into())),
        Err(_) => {
            fsm.stop().await;
            Err(Idscp2Error::Timeout("handshake"))
        }
    }
}

/// Exposes the peer's leaf certificate DER bytes from a completed TLS session, for I6
/// fingerprint binding. Implemented for both roles' stream types below.
pub trait PeerCertificate {
    fn peer_leaf_certificate_der(&self) -> Option<Vec<u8>>;
}

impl<T> PeerCertificate for tokio_rustls::server::TlsStream<T> {
    fn peer_leaf_certificate_der(&self) -> Option<Vec<u8>> {
        let (_, conn) = self.get_ref();
        conn.peer_certificates().and_then(|certs| certs.first()).map(|c| c.as_ref().to_vec())
    }
}

impl<T> PeerCertificate for tokio_rustls::client::TlsStream<T> {
    fn peer_leaf_certificate_der(&self) -> Option<Vec<u8>> {
        let (_, conn) = self.get_ref();
        conn.peer_certificates().and_then(|certs| certs.first()).map(|c| c.as_ref().to_vec())
    }
}
