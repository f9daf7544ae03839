//! The file server: replication of encrypted files between peers.
//!
//! `store` writes a file locally, then announces it to every peer with a
//! `StoreFile` message directly followed by a stream of freshly encrypted
//! bytes. `get` serves local copies and otherwise asks all peers with
//! `GetFile`; holders reply with a stream of `u64` little-endian length plus
//! the stored ciphertext.
//!
//! All nodes of one network must share the encryption key: replicated and
//! fetched ciphertext is stored as received and decrypted locally.

use std::{
    collections::HashMap,
    fmt,
    io::Cursor,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use futures::future::join_all;
use hoard_core::{
    DefaultEncrypter, Encrypter, PathTransform, Store, StoreError, StoreOpts,
    hashed_path_transform, store::DEFAULT_ROOT,
};
use hoard_p2p::{
    INCOMING_STREAM, Msg, Peer, PeerReader, TcpTransport, TcpTransportOpts, Transport,
    TransportError,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::{io::InspectReader, sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    error::ServerError,
    message::{Message, StoreFile},
    peers::PeerTable,
};

pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct FileServerOpts {
    pub listen_addr: String,
    /// Peers dialed on start.
    pub bootstrap_nodes: Vec<String>,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    /// Shared network key. `None`, or a key of the wrong length, means a
    /// fresh key is generated.
    pub encryption_key: Option<Vec<u8>>,
    /// How long `get` waits for any peer to answer.
    pub get_timeout: Duration,
    /// Upper bound for every single send to a peer.
    pub write_timeout: Duration,
}

impl FileServerOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            bootstrap_nodes: Vec::new(),
            storage_root: PathBuf::from(DEFAULT_ROOT),
            path_transform: hashed_path_transform,
            encryption_key: None,
            get_timeout: DEFAULT_GET_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl fmt::Debug for FileServerOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileServerOpts")
            .field("listen_addr", &self.listen_addr)
            .field("bootstrap_nodes", &self.bootstrap_nodes)
            .field("storage_root", &self.storage_root)
            .field("get_timeout", &self.get_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

/// A node of the network. Cloning is cheap; clones share the node.
#[derive(Clone)]
pub struct FileServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    listen_addr: String,
    bootstrap_nodes: Vec<String>,
    get_timeout: Duration,
    write_timeout: Duration,
    store: Store,
    encrypter: Box<dyn Encrypter>,
    transport: Box<dyn Transport>,
    peers: Arc<PeerTable>,
    /// Serializes network fetches; replies carry no key.
    fetch_lock: tokio::sync::Mutex<()>,
    /// Waiter of the fetch in flight, taken by the first reply.
    fetch_reply: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    shutdown: CancellationToken,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    /// Per-peer sends and stream consumers.
    tasks: TaskTracker,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Self {
        let encrypter = DefaultEncrypter::new_or_generate(opts.encryption_key.as_deref());
        let store = Store::new(StoreOpts {
            root: opts.storage_root,
            path_transform: opts.path_transform,
        });

        let peers = Arc::new(PeerTable::new());
        let mut transport_opts = TcpTransportOpts::new(opts.listen_addr.clone());
        let joined = peers.clone();
        transport_opts.on_peer = Some(Arc::new(move |peer: Peer| -> Result<(), TransportError> {
            let direction = if peer.is_outbound() { "outbound" } else { "inbound" };
            info!("connected with {direction} peer {peer}");
            joined.add(peer);
            Ok(())
        }));
        let lost = peers.clone();
        transport_opts.on_peer_lost = Some(Arc::new(move |peer: &Peer| {
            if lost.remove(&peer.remote_addr()).is_some() {
                info!("peer {peer} disconnected");
            }
        }));

        FileServer {
            inner: Arc::new(ServerInner {
                listen_addr: opts.listen_addr,
                bootstrap_nodes: opts.bootstrap_nodes,
                get_timeout: opts.get_timeout,
                write_timeout: opts.write_timeout,
                store,
                encrypter: Box::new(encrypter),
                transport: Box::new(TcpTransport::new(transport_opts)),
                peers,
                fetch_lock: tokio::sync::Mutex::new(()),
                fetch_reply: Mutex::new(None),
                shutdown: CancellationToken::new(),
                dispatch: Mutex::new(None),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Starts listening, spawns the message loop and dials all bootstrap
    /// nodes. Returns once every dial attempt has finished; failed dials are
    /// only logged.
    pub async fn start(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        inner.transport.listen_and_accept().await?;
        let messages = inner
            .transport
            .consume()
            .ok_or(ServerError::AlreadyStarted)?;
        info!("({}) file server started", inner.node_addr());

        let dispatch = tokio::spawn(inner.clone().dispatch_loop(messages));
        *lock(&inner.dispatch) = Some(dispatch);

        inner.bootstrap_network().await;
        Ok(())
    }

    /// Stops the message loop and the transport, waits up to the write
    /// timeout for running peer sends, then closes every peer connection.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let peers = inner.peers.snapshot();
        inner.shutdown.cancel();
        if let Err(err) = inner.transport.close().await {
            warn!("({}) failed to close transport: {err}", inner.node_addr());
        }
        let dispatch = lock(&inner.dispatch).take();
        if let Some(dispatch) = dispatch {
            let _ = dispatch.await;
        }
        inner.tasks.close();
        if tokio::time::timeout(inner.write_timeout, inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "({}) {} peer tasks still running at shutdown",
                inner.node_addr(),
                inner.tasks.len()
            );
        }
        for peer in peers {
            let _ = peer.close().await;
        }
        info!("({}) file server stopped", inner.node_addr());
    }

    /// Encrypts `reader` into the local store under `key` and replicates it
    /// to every connected peer. Returns the stored size, nonce included.
    ///
    /// Replication runs in the background; failures towards single peers
    /// are logged and do not fail the call.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let inner = &self.inner;
        // u64::MAX has the longest encoding of any size
        Message::store_file(key, u64::MAX).to_frame()?;

        let mut plaintext = Vec::new();
        let size = {
            let mut tee =
                InspectReader::new(reader, |chunk: &[u8]| plaintext.extend_from_slice(chunk));
            inner
                .store
                .write_encrypted(key, inner.encrypter.as_ref(), &mut tee)
                .await?
        };
        info!(
            "({}) stored '{key}' ({size} bytes) on disk",
            inner.node_addr()
        );

        let announce = Bytes::from(Message::store_file(key, size).to_frame()?);
        let plaintext = Bytes::from(plaintext);
        for peer in inner.peers.snapshot() {
            let inner = inner.clone();
            let announce = announce.clone();
            let plaintext = plaintext.clone();
            self.inner.tasks.spawn(async move {
                let replicate = inner.replicate_to(&peer, &announce, &plaintext);
                inner.send_bounded(&peer, "replication", replicate).await;
            });
        }
        Ok(size)
    }

    /// Returns the plaintext of `key`, fetching it from the network first if
    /// there is no local copy.
    pub async fn get(&self, key: &str) -> Result<Cursor<Vec<u8>>, ServerError> {
        let inner = &self.inner;
        if let Some(found) = inner.read_local(key).await? {
            debug!("({}) serving '{key}' from local disk", inner.node_addr());
            return Ok(found);
        }

        let _fetch = inner.fetch_lock.lock().await;
        // an earlier fetch may have brought the key in
        if let Some(found) = inner.read_local(key).await? {
            return Ok(found);
        }

        let request = Bytes::from(Message::get_file(key).to_frame()?);
        let (reply_tx, reply_rx) = oneshot::channel();
        *lock(&inner.fetch_reply) = Some(reply_tx);
        info!(
            "({}) '{key}' not on disk, asking {} peers",
            inner.node_addr(),
            inner.peers.len()
        );
        inner.broadcast(request);

        let reply = tokio::time::timeout(inner.get_timeout, reply_rx).await;
        lock(&inner.fetch_reply).take();
        let Ok(Ok(ciphertext)) = reply else {
            return Err(ServerError::NotFound(key.to_owned()));
        };

        let n = inner.store.write(key, &mut ciphertext.as_slice()).await?;
        info!(
            "({}) fetched '{key}' ({n} bytes) from the network",
            inner.node_addr()
        );
        inner
            .read_local(key)
            .await?
            .ok_or_else(|| ServerError::NotFound(key.to_owned()))
    }

    /// Removes `key` from the local store only.
    pub async fn delete_local(&self, key: &str) -> Result<(), ServerError> {
        Ok(self.inner.store.delete(key).await?)
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.inner.peers.addrs()
    }

    pub fn local_store(&self) -> &Store {
        &self.inner.store
    }

    pub fn listen_addr(&self) -> &str {
        &self.inner.listen_addr
    }

    /// The bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }
}

impl ServerInner {
    fn node_addr(&self) -> String {
        match self.transport.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.listen_addr.clone(),
        }
    }

    async fn bootstrap_network(&self) {
        let dials = self
            .bootstrap_nodes
            .iter()
            .filter(|addr| !addr.is_empty())
            .map(|addr| async move {
                debug!("({}) dialing {addr}", self.node_addr());
                if let Err(err) = self.transport.dial(addr).await {
                    warn!("({}) failed to dial {addr}: {err}", self.node_addr());
                }
            });
        join_all(dials).await;
    }

    async fn dispatch_loop(self: Arc<Self>, mut messages: mpsc::Receiver<Msg>) {
        // StoreFile announcements waiting for their stream, per connection
        let mut pending: HashMap<SocketAddr, StoreFile> = HashMap::new();
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = messages.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let from = msg.from;
            if let Err(err) = self.handle_msg(msg, &mut pending) {
                warn!("({}) dropping message from {from}: {err}", self.node_addr());
            }
        }
        debug!("({}) message loop stopped", self.node_addr());
    }

    fn handle_msg(
        self: &Arc<Self>,
        msg: Msg,
        pending: &mut HashMap<SocketAddr, StoreFile>,
    ) -> Result<(), ServerError> {
        let Some(peer) = self.peers.get(&msg.from) else {
            if msg.stream {
                // the stream length is unknown, the connection cannot resync
                let unknown = msg.peer;
                self.tasks.spawn(async move {
                    let _ = unknown.close().await;
                });
            }
            return Err(ServerError::UnknownPeer(msg.from));
        };

        if msg.stream {
            let inner = self.clone();
            match pending.remove(&msg.from) {
                Some(announce) => {
                    self.tasks.spawn(async move { inner.receive_file(peer, announce).await });
                }
                // no announcement: a reply to our GetFile
                None => {
                    self.tasks.spawn(async move { inner.receive_reply(peer).await });
                }
            }
            return Ok(());
        }

        match Message::decode(&msg.payload)? {
            Message::StoreFile(announce) => {
                debug!(
                    "({}) {peer} announced '{}' ({} bytes)",
                    self.node_addr(),
                    announce.key,
                    announce.size
                );
                pending.insert(msg.from, announce);
            }
            Message::GetFile(request) => {
                let inner = self.clone();
                self.tasks.spawn(async move { inner.serve_file(peer, request.key).await });
            }
        }
        Ok(())
    }

    /// Stores an announced stream verbatim. Whatever happens, exactly the
    /// announced number of bytes is taken off the connection.
    async fn receive_file(&self, peer: Peer, announce: StoreFile) {
        let StoreFile { key, size } = announce;
        let result = {
            let mut reader = peer.reader().await;
            let mut body = (&mut *reader).take(size);
            let result = match self.store.write(&key, &mut body).await {
                Ok(n) if n < size => Err(ServerError::ShortStream {
                    expected: size,
                    actual: n,
                }),
                Ok(_) => Ok(()),
                Err(err) => Err(err.into()),
            };
            if result.is_err() {
                let _ = tokio::io::copy(&mut body, &mut tokio::io::sink()).await;
            }
            result
        };
        peer.close_stream();

        match result {
            Ok(()) => info!(
                "({}) stored replicated '{key}' ({size} bytes) from {peer}",
                self.node_addr()
            ),
            Err(err) => warn!(
                "({}) failed to store '{key}' from {peer}: {err}",
                self.node_addr()
            ),
        }
    }

    /// Reads a GetFile reply and hands it to the fetch in flight, if any.
    async fn receive_reply(&self, peer: Peer) {
        let wanted = lock(&self.fetch_reply).is_some();
        let result = {
            let mut reader = peer.reader().await;
            read_reply(&mut reader, wanted).await
        };
        peer.close_stream();

        let ciphertext = match result {
            Ok(ciphertext) => ciphertext,
            Err(err) => {
                warn!(
                    "({}) broken reply stream from {peer}: {err}",
                    self.node_addr()
                );
                return;
            }
        };
        if ciphertext.is_empty() {
            debug!("({}) discarded reply from {peer}", self.node_addr());
            return;
        }
        let waiter = lock(&self.fetch_reply).take();
        match waiter {
            Some(waiter) => {
                debug!(
                    "({}) received {} bytes from {peer}",
                    self.node_addr(),
                    ciphertext.len()
                );
                let _ = waiter.send(ciphertext);
            }
            None => debug!(
                "({}) discarded late reply from {peer}",
                self.node_addr()
            ),
        }
    }

    /// Streams the stored ciphertext of `key` back to `peer`. Missing keys
    /// get no answer.
    async fn serve_file(&self, peer: Peer, key: String) {
        if !self.store.exists(&key).await {
            debug!(
                "({}) '{key}' requested by {peer} is not on disk",
                self.node_addr()
            );
            return;
        }
        let (size, file) = match self.store.read(&key).await {
            Ok(found) => found,
            Err(err) => {
                warn!("({}) failed to open '{key}': {err}", self.node_addr());
                return;
            }
        };

        info!(
            "({}) serving '{key}' ({size} bytes) to {peer}",
            self.node_addr()
        );
        let reply = async {
            let mut writer = peer.writer().await;
            writer.write_all(&[INCOMING_STREAM]).await?;
            writer.write_u64_le(size).await?;
            let sent = tokio::io::copy(&mut file.take(size), &mut **writer).await?;
            if sent < size {
                return Err(ServerError::ShortStream {
                    expected: size,
                    actual: sent,
                });
            }
            writer.flush().await?;
            Ok::<(), ServerError>(())
        };
        self.send_bounded(&peer, "reply", reply).await;
    }

    /// Announce, stream marker and ciphertext in one hold of the writer.
    async fn replicate_to(
        &self,
        peer: &Peer,
        announce: &[u8],
        plaintext: &[u8],
    ) -> Result<(), ServerError> {
        let mut writer = peer.writer().await;
        writer.write_all(announce).await?;
        writer.write_all(&[INCOMING_STREAM]).await?;
        let mut src = plaintext;
        self.encrypter
            .encrypt(&mut src, &mut **writer)
            .await
            .map_err(StoreError::from)?;
        writer.flush().await?;
        Ok(())
    }

    fn broadcast(self: &Arc<Self>, frame: Bytes) {
        for peer in self.peers.snapshot() {
            let inner = self.clone();
            let frame = frame.clone();
            self.tasks.spawn(async move {
                let send = async { peer.send(&frame).await.map_err(ServerError::from) };
                inner.send_bounded(&peer, "broadcast", send).await;
            });
        }
    }

    /// Runs one send to `peer` under the write timeout. A failed or timed out
    /// send may have left a partial frame behind, so the connection is closed.
    async fn send_bounded<F>(&self, peer: &Peer, what: &str, send: F)
    where
        F: Future<Output = Result<(), ServerError>>,
    {
        let result = match tokio::time::timeout(self.write_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::WriteTimeout),
        };
        if let Err(err) = result {
            warn!(
                "({}) {what} to {peer} failed, closing connection: {err}",
                self.node_addr()
            );
            let _ = peer.close().await;
        }
    }

    async fn read_local(&self, key: &str) -> Result<Option<Cursor<Vec<u8>>>, ServerError> {
        if !self.store.exists(key).await {
            return Ok(None);
        }
        let mut plaintext = Vec::new();
        match self
            .store
            .read_decrypted(key, self.encrypter.as_ref(), &mut plaintext)
            .await
        {
            Ok(_) => Ok(Some(Cursor::new(plaintext))),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Reads a `u64` LE length and that many bytes. With `keep == false` the
/// bytes are drained and an empty buffer is returned.
async fn read_reply(reader: &mut PeerReader, keep: bool) -> Result<Vec<u8>, ServerError> {
    let size = reader.read_u64_le().await?;
    let mut body = (&mut *reader).take(size);
    let mut ciphertext = Vec::new();
    let n = if keep {
        body.read_to_end(&mut ciphertext).await? as u64
    } else {
        tokio::io::copy(&mut body, &mut tokio::io::sink()).await?
    };
    if n < size {
        return Err(ServerError::ShortStream {
            expected: size,
            actual: n,
        });
    }
    Ok(ciphertext)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpStream;

    use super::*;

    async fn started_server(dir: &tempfile::TempDir) -> FileServer {
        let mut opts = FileServerOpts::new("127.0.0.1:0");
        opts.storage_root = dir.path().to_path_buf();
        let server = FileServer::new(opts);
        server.start().await.unwrap();
        server
    }

    #[tokio::test]
    async fn test_stream_from_unknown_peer_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let server = started_server(&dir).await;
        let mut conn = TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();
        let addr = conn.local_addr().unwrap();
        for _ in 0..200 {
            if server.peer_addrs().contains(&addr) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.inner.peers.remove(&addr).is_some());

        conn.write_all(&[INCOMING_STREAM]).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .expect("connection should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_store_rejects_oversized_key_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let server = started_server(&dir).await;
        let key = "k".repeat(2 * hoard_p2p::MAX_MESSAGE_SIZE);

        let result = server.store(&key, &mut &b"data"[..]).await;
        assert!(matches!(result, Err(ServerError::MessageTooLarge(_))));
        assert!(!server.local_store().exists(&key).await);

        server.stop().await;
    }
}
