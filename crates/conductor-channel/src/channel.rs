//! Unix-domain socket channel: broker server and peer client.

use crate::frame;
use conductor_core::ids::AgentId;
use conductor_core::message::AgentMessage;
use conductor_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INBOUND_QUEUE_DEPTH: usize = 1024;
const PEER_QUEUE_DEPTH: usize = 256;

type PeerMap = Arc<StdMutex<HashMap<AgentId, mpsc::Sender<AgentMessage>>>>;

/// Broker-side channel. Binds the socket, accepts peers, routes frames by
/// `receiver_id`, and fans out broadcasts to every peer but the sender.
pub struct ChannelServer {
    local_id: AgentId,
    path: PathBuf,
    peers: PeerMap,
    inbound: Mutex<mpsc::Receiver<AgentMessage>>,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: JoinHandle<()>,
}

impl ChannelServer {
    /// Bind a Unix-domain stream socket at `path`, unlinking any stale
    /// file first, and start accepting connections.
    pub async fn bind(path: impl AsRef<Path>, local_id: AgentId) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // A leftover socket file from a previous run would make bind fail.
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path).map_err(|e| Error::ChannelBind {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let peers: PeerMap = Arc::new(StdMutex::new(HashMap::new()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_handle = tokio::spawn(accept_loop(
            listener,
            local_id.clone(),
            Arc::clone(&peers),
            inbound_tx,
            shutdown_rx,
        ));

        info!(path = %path.display(), "Channel server listening");

        Ok(Self {
            local_id,
            path,
            peers,
            inbound: Mutex::new(inbound_rx),
            shutdown_tx,
            accept_handle,
        })
    }

    pub fn local_id(&self) -> &AgentId {
        &self.local_id
    }

    /// Connected peer count.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer map lock poisoned").len()
    }

    /// Send to the peer named by `message.receiver_id`, or fan out when the
    /// receiver is the broadcast sentinel.
    pub async fn send(&self, message: AgentMessage) -> Result<()> {
        if message.is_broadcast() {
            let sender = message.sender_id.clone();
            return self.broadcast(message, Some(&sender)).await;
        }

        let target = {
            let peers = self.peers.lock().expect("peer map lock poisoned");
            peers.get(&message.receiver_id).cloned()
        };
        match target {
            Some(tx) => tx
                .send(message)
                .await
                .map_err(|_| Error::ChannelWrite("peer disconnected".into())),
            None => Err(Error::AgentNotFound(message.receiver_id.to_string())),
        }
    }

    /// Deliver to every connected peer except `except`. Delivering to zero
    /// peers is not an error.
    pub async fn broadcast(&self, message: AgentMessage, except: Option<&AgentId>) -> Result<()> {
        // Clone the target list so no I/O happens under the lock.
        let targets: Vec<(AgentId, mpsc::Sender<AgentMessage>)> = {
            let peers = self.peers.lock().expect("peer map lock poisoned");
            peers
                .iter()
                .filter(|(id, _)| except.map_or(true, |e| *id != e))
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };

        for (peer_id, tx) in targets {
            if tx.send(message.clone()).await.is_err() {
                debug!(peer = %peer_id, "Dropping broadcast to disconnected peer");
            }
        }
        Ok(())
    }

    /// Next inbound message addressed to this server, or `None` on timeout.
    pub async fn receive(&self, timeout: Duration) -> Option<AgentMessage> {
        let mut inbound = self.inbound.lock().await;
        tokio::time::timeout(timeout, inbound.recv()).await.ok()?
    }

    /// Stop accepting, disconnect peers, and unlink the socket path.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.accept_handle.abort();
        self.peers.lock().expect("peer map lock poisoned").clear();
        let _ = std::fs::remove_file(&self.path);
        info!(path = %self.path.display(), "Channel server closed");
    }
}

async fn accept_loop(
    listener: UnixListener,
    local_id: AgentId,
    peers: PeerMap,
    inbound_tx: mpsc::Sender<AgentMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            local_id.clone(),
                            Arc::clone(&peers),
                            inbound_tx.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    local_id: AgentId,
    peers: PeerMap,
    inbound_tx: mpsc::Sender<AgentMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<AgentMessage>(PEER_QUEUE_DEPTH);
    let writer_handle = tokio::spawn(peer_writer(write_half, out_rx));

    let mut peer_id: Option<AgentId> = None;

    loop {
        tokio::select! {
            read = frame::read_frame(&mut read_half) => {
                match read {
                    Ok(Some(message)) => {
                        register_peer(&peers, &mut peer_id, &message.sender_id, &out_tx);
                        route_message(message, &local_id, &peers, &inbound_tx).await;
                    }
                    Ok(None) => break,
                    Err(Error::Protocol(e)) => {
                        // The body was consumed, so the frame boundary is
                        // intact; drop the frame and keep the peer.
                        warn!(peer = ?peer_id, error = %e, "Dropping malformed frame");
                    }
                    Err(e) => {
                        debug!(peer = ?peer_id, error = %e, "Peer read failed");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    if let Some(id) = peer_id {
        let mut map = peers.lock().expect("peer map lock poisoned");
        // Only unregister if the map still points at this connection.
        let stale = map
            .get(&id)
            .map(|tx| tx.same_channel(&out_tx))
            .unwrap_or(false);
        if stale {
            map.remove(&id);
        }
        debug!(peer = %id, "Peer disconnected");
    }
    drop(out_tx);
    let _ = writer_handle.await;
}

fn register_peer(
    peers: &PeerMap,
    peer_id: &mut Option<AgentId>,
    sender_id: &AgentId,
    out_tx: &mpsc::Sender<AgentMessage>,
) {
    if peer_id.as_ref() == Some(sender_id) {
        return;
    }
    let mut map = peers.lock().expect("peer map lock poisoned");
    if let Some(previous) = peer_id.take() {
        map.remove(&previous);
    }
    map.insert(sender_id.clone(), out_tx.clone());
    *peer_id = Some(sender_id.clone());
    debug!(peer = %sender_id, "Peer registered");
}

async fn route_message(
    message: AgentMessage,
    local_id: &AgentId,
    peers: &PeerMap,
    inbound_tx: &mpsc::Sender<AgentMessage>,
) {
    if message.is_broadcast() {
        let targets: Vec<(AgentId, mpsc::Sender<AgentMessage>)> = {
            let map = peers.lock().expect("peer map lock poisoned");
            map.iter()
                .filter(|(id, _)| **id != message.sender_id)
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };
        for (peer, tx) in targets {
            if tx.send(message.clone()).await.is_err() {
                debug!(peer = %peer, "Dropping broadcast to disconnected peer");
            }
        }
        // The coordinator observes broadcasts too.
        let _ = inbound_tx.send(message).await;
        return;
    }

    if message.receiver_id == *local_id {
        let _ = inbound_tx.send(message).await;
        return;
    }

    let target = {
        let map = peers.lock().expect("peer map lock poisoned");
        map.get(&message.receiver_id).cloned()
    };
    match target {
        Some(tx) => {
            if tx.send(message).await.is_err() {
                debug!("Dropping message for disconnected peer");
            }
        }
        None => {
            warn!(receiver = %message.receiver_id, "Dropping message for unknown receiver");
        }
    }
}

async fn peer_writer(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::Receiver<AgentMessage>) {
    while let Some(message) = out_rx.recv().await {
        if let Err(e) = frame::write_frame(&mut write_half, &message).await {
            debug!(error = %e, "Peer write failed");
            break;
        }
    }
}

/// Agent-side channel connected to the broker socket.
pub struct ChannelClient {
    local_id: AgentId,
    writer: Mutex<OwnedWriteHalf>,
    inbound: Mutex<mpsc::Receiver<AgentMessage>>,
    reader_handle: JoinHandle<()>,
}

impl ChannelClient {
    /// Connect to the broker at `path`, waiting at most `connect_timeout`.
    pub async fn connect(
        path: impl AsRef<Path>,
        local_id: AgentId,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = tokio::time::timeout(connect_timeout, UnixStream::connect(&path))
            .await
            .map_err(|_| Error::ChannelConnect {
                path: path.display().to_string(),
                message: "connect timeout".into(),
            })?
            .map_err(|e| Error::ChannelConnect {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let reader_handle = tokio::spawn(client_reader(read_half, inbound_tx));

        debug!(path = %path.display(), id = %local_id, "Channel client connected");

        Ok(Self {
            local_id,
            writer: Mutex::new(write_half),
            inbound: Mutex::new(inbound_rx),
            reader_handle,
        })
    }

    pub fn local_id(&self) -> &AgentId {
        &self.local_id
    }

    /// Write one frame. Writes are serialized behind the writer lock so
    /// concurrent senders never interleave frames.
    pub async fn send(&self, message: AgentMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        frame::write_frame(&mut *writer, &message).await
    }

    /// Next inbound message, or `None` on timeout.
    pub async fn receive(&self, timeout: Duration) -> Option<AgentMessage> {
        let mut inbound = self.inbound.lock().await;
        tokio::time::timeout(timeout, inbound.recv()).await.ok()?
    }

    pub async fn close(&self) {
        self.reader_handle.abort();
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

async fn client_reader(mut read_half: OwnedReadHalf, inbound_tx: mpsc::Sender<AgentMessage>) {
    loop {
        match frame::read_frame(&mut read_half).await {
            Ok(Some(message)) => {
                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(Error::Protocol(e)) => {
                warn!(error = %e, "Dropping malformed frame");
            }
            Err(e) => {
                debug!(error = %e, "Broker read failed");
                break;
            }
        }
    }
}
