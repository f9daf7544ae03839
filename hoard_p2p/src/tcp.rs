use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    CborDecoder, Decoder, Frame, Handshake, Msg, NopHandshake, OnPeer, OnPeerLost, Peer,
    Transport, TransportError,
};

pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
    pub on_peer: Option<OnPeer>,
    pub on_peer_lost: Option<OnPeerLost>,
}

impl TcpTransportOpts {
    /// Options with a no-op handshake, the CBOR decoder and no callbacks.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NopHandshake),
            decoder: Arc::new(CborDecoder),
            on_peer: None,
            on_peer_lost: None,
        }
    }
}

/// TCP implementation of [`Transport`].
///
/// Every connection, inbound or dialed, gets its own decode loop feeding the
/// shared consumption channel. The channel holds a single message, so a slow
/// consumer applies backpressure to all connections. [`Transport::close`]
/// drops the sending side, after which the consumer sees the channel end.
pub struct TcpTransport {
    listen_addr: String,
    conns: Arc<ConnHandler>,
    consumer: Mutex<Option<mpsc::Receiver<Msg>>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
}

struct ConnHandler {
    handshake: Arc<dyn Handshake>,
    decoder: Arc<dyn Decoder>,
    on_peer: Option<OnPeer>,
    on_peer_lost: Option<OnPeerLost>,
    /// `None` once the transport is closed.
    tx: Mutex<Option<mpsc::Sender<Msg>>>,
}

enum LoopExit {
    ConnectionEnded,
    TransportClosed,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (tx, rx) = mpsc::channel(1);
        TcpTransport {
            listen_addr: opts.listen_addr,
            conns: Arc::new(ConnHandler {
                handshake: opts.handshake,
                decoder: opts.decoder,
                on_peer: opts.on_peer,
                on_peer_lost: opts.on_peer_lost,
                tx: Mutex::new(Some(tx)),
            }),
            consumer: Mutex::new(Some(rx)),
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    async fn listen_and_accept(&self) -> Result<(), TransportError> {
        if let Some(addr) = self.local_addr() {
            return Err(TransportError::AlreadyListening(addr));
        }
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        if self.local_addr.set(local_addr).is_err() {
            return Err(TransportError::AlreadyListening(local_addr));
        }
        info!("tcp transport listening on {local_addr}");

        tokio::spawn(accept_loop(
            listener,
            self.conns.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<Peer, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let peer = self.conns.setup(stream, true).await?;
        tokio::spawn(
            self.conns
                .clone()
                .read_loop(peer.clone(), self.shutdown.clone()),
        );
        Ok(peer)
    }

    fn consume(&self) -> Option<mpsc::Receiver<Msg>> {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        self.conns
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, conns: Arc<ConnHandler>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("tcp accept loop stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {addr}");
                    let conns = conns.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Ok(peer) = conns.setup(stream, false).await {
                            conns.read_loop(peer, shutdown).await;
                        }
                    });
                }
                Err(err) => warn!("tcp accept error: {err}"),
            }
        }
    }
}

impl ConnHandler {
    /// Wraps a fresh connection, runs the handshake and the peer callback.
    /// The connection is closed if either fails.
    async fn setup(&self, stream: TcpStream, outbound: bool) -> Result<Peer, TransportError> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let peer = Peer::new(remote_addr, outbound, reader, writer);

        if let Err(err) = self.handshake.handshake(&peer).await {
            warn!("handshake with {remote_addr} failed: {err}");
            let _ = peer.close().await;
            return Err(err);
        }
        if let Some(on_peer) = &self.on_peer {
            if let Err(err) = on_peer(peer.clone()) {
                warn!("peer {remote_addr} rejected: {err}");
                let _ = peer.close().await;
                return Err(err);
            }
        }
        debug!(outbound, "connected to peer {remote_addr}");
        Ok(peer)
    }

    async fn read_loop(self: Arc<Self>, peer: Peer, shutdown: CancellationToken) {
        let exit = self.decode_frames(&peer, &shutdown).await;
        if let Some(on_peer_lost) = &self.on_peer_lost {
            on_peer_lost(&peer);
        }
        if let LoopExit::ConnectionEnded = exit {
            let _ = peer.close().await;
        }
    }

    async fn decode_frames(&self, peer: &Peer, shutdown: &CancellationToken) -> LoopExit {
        let from = peer.remote_addr();
        loop {
            let frame = {
                let mut reader = peer.reader().await;
                tokio::select! {
                    _ = peer.closed().cancelled() => return LoopExit::ConnectionEnded,
                    _ = shutdown.cancelled() => return LoopExit::TransportClosed,
                    frame = self.decoder.decode(&mut reader) => frame,
                }
            };

            match frame {
                Ok(Frame::Message(payload)) => {
                    if !self.deliver(Msg::message(peer.clone(), payload), shutdown).await {
                        return LoopExit::TransportClosed;
                    }
                }
                Ok(Frame::Stream) => {
                    debug!("incoming stream from {from}, waiting for it to be drained");
                    if !self.deliver(Msg::stream(peer.clone()), shutdown).await {
                        return LoopExit::TransportClosed;
                    }
                    tokio::select! {
                        _ = peer.stream_released() => debug!("stream from {from} drained"),
                        _ = peer.closed().cancelled() => return LoopExit::ConnectionEnded,
                        _ = shutdown.cancelled() => return LoopExit::TransportClosed,
                    }
                }
                Err(err) if err.is_fatal() => {
                    debug!("connection to {from} ended: {err}");
                    return LoopExit::ConnectionEnded;
                }
                Err(err) => warn!("dropping frame from {from}: {err}"),
            }
        }
    }

    /// Returns `false` once nobody will receive the message anymore.
    async fn deliver(&self, msg: Msg, shutdown: &CancellationToken) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(tx) = tx else {
            return false;
        };
        tokio::select! {
            sent = tx.send(msg) => sent.is_ok(),
            _ = shutdown.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{INCOMING_STREAM, message_frame};

    type PeerMap = Arc<Mutex<HashMap<SocketAddr, Peer>>>;

    /// A transport on an ephemeral port whose connected and lost peers are
    /// recorded in the returned maps.
    async fn listening_transport() -> (TcpTransport, PeerMap, PeerMap) {
        let connected = PeerMap::default();
        let lost = PeerMap::default();
        let mut opts = TcpTransportOpts::new("127.0.0.1:0");
        let on_connect = connected.clone();
        opts.on_peer = Some(Arc::new(move |peer: Peer| -> Result<(), TransportError> {
            on_connect.lock().unwrap().insert(peer.remote_addr(), peer);
            Ok(())
        }));
        let on_lost = lost.clone();
        opts.on_peer_lost = Some(Arc::new(move |peer: &Peer| {
            on_lost
                .lock()
                .unwrap()
                .insert(peer.remote_addr(), peer.clone());
        }));

        let transport = TcpTransport::new(opts);
        transport.listen_and_accept().await.unwrap();
        (transport, connected, lost)
    }

    async fn wait_for_peer(peers: &PeerMap) -> Peer {
        for _ in 0..200 {
            if let Some(peer) = peers.lock().unwrap().values().next().cloned() {
                return peer;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no peer showed up");
    }

    fn dial_addr(transport: &TcpTransport) -> String {
        transport.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_dial_registers_both_sides() {
        let (server, server_peers, _) = listening_transport().await;
        let (client, client_peers, _) = listening_transport().await;

        let peer = client.dial(&dial_addr(&server)).await.unwrap();
        assert!(peer.is_outbound());
        assert_eq!(peer.remote_addr(), server.local_addr().unwrap());
        // on_peer ran before dial returned
        assert!(client_peers.lock().unwrap().contains_key(&peer.remote_addr()));

        let inbound = wait_for_peer(&server_peers).await;
        assert!(!inbound.is_outbound());
    }

    #[tokio::test]
    async fn test_message_delivery() {
        let (server, _, _) = listening_transport().await;
        let (client, _, _) = listening_transport().await;
        let mut messages = server.consume().unwrap();
        assert!(server.consume().is_none());

        let peer = client.dial(&dial_addr(&server)).await.unwrap();
        let payload = minicbor::to_vec(("key", 42u64)).unwrap();
        peer.send(&message_frame(&payload)).await.unwrap();

        let msg = messages.recv().await.unwrap();
        assert!(!msg.stream);
        assert_eq!(msg.payload, payload);
    }

    #[tokio::test]
    async fn test_stream_pauses_decoding_until_released() {
        let (server, server_peers, _) = listening_transport().await;
        let (client, _, _) = listening_transport().await;
        let mut messages = server.consume().unwrap();

        let peer = client.dial(&dial_addr(&server)).await.unwrap();
        let after = minicbor::to_vec("after the stream").unwrap();
        let mut wire = vec![INCOMING_STREAM];
        wire.extend_from_slice(b"0123456789");
        wire.extend_from_slice(&message_frame(&after));
        peer.send(&wire).await.unwrap();

        let signal = messages.recv().await.unwrap();
        assert!(signal.stream);
        let inbound = wait_for_peer(&server_peers).await;
        assert_eq!(signal.from, inbound.remote_addr());

        let mut body = [0u8; 10];
        inbound.reader().await.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"0123456789");
        inbound.close_stream();

        let msg = messages.recv().await.unwrap();
        assert!(!msg.stream);
        assert_eq!(msg.payload, after);
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_connection() {
        struct Reject;

        #[async_trait]
        impl Handshake for Reject {
            async fn handshake(&self, _peer: &Peer) -> Result<(), TransportError> {
                Err(TransportError::Handshake("not today".into()))
            }
        }

        let (server, _, _) = listening_transport().await;
        let connected = PeerMap::default();
        let mut opts = TcpTransportOpts::new("127.0.0.1:0");
        opts.handshake = Arc::new(Reject);
        let on_connect = connected.clone();
        opts.on_peer = Some(Arc::new(move |peer: Peer| -> Result<(), TransportError> {
            on_connect.lock().unwrap().insert(peer.remote_addr(), peer);
            Ok(())
        }));
        let client = TcpTransport::new(opts);

        let err = client.dial(&dial_addr(&server)).await.unwrap_err();
        assert!(matches!(err, TransportError::Handshake(_)));
        assert!(connected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_reports_lost_peer() {
        let (server, _, server_lost) = listening_transport().await;
        let (client, _, _) = listening_transport().await;

        let peer = client.dial(&dial_addr(&server)).await.unwrap();
        peer.close().await.unwrap();
        assert!(peer.is_closed());

        let lost = wait_for_peer(&server_lost).await;
        assert!(!lost.is_outbound());
    }

    #[tokio::test]
    async fn test_listen_twice() {
        let (server, _, _) = listening_transport().await;
        assert!(matches!(
            server.listen_and_accept().await,
            Err(TransportError::AlreadyListening(_))
        ));
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_consumption_channel() {
        let (server, _, _) = listening_transport().await;
        let (client, _, _) = listening_transport().await;
        let mut messages = server.consume().unwrap();
        let _peer = client.dial(&dial_addr(&server)).await.unwrap();

        server.close().await.unwrap();
        let received = tokio::time::timeout(Duration::from_millis(500), messages.recv())
            .await
            .expect("channel should end after close");
        assert!(received.is_none());
    }
}
