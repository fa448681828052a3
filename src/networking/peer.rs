/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Authenticated connections to a single remote key.
//!
//! Both transports write through a bounded outbound queue drained by a dedicated writer thread, ping the
//! remote end every [`PING_INTERVAL`], and close themselves after [`SILENCE_TIMEOUT`] without hearing
//! anything back. Closing shuts the underlying socket down, which unblocks a pending [`Peer::read`].

use std::{
    io::{self, ErrorKind, Write},
    net::{Shutdown, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use tungstenite::{Message, WebSocket};

use crate::types::{
    crypto_primitives::SignatureError,
    data_types::{ChainID, PublicKey},
};

use super::{
    codec::{ping_frame, read_frame, CodecError, Frame},
    handshake::HandshakeOutcome,
};

pub const PING_INTERVAL: Duration = Duration::from_secs(5);
pub const SILENCE_TIMEOUT: Duration = Duration::from_secs(15);
pub const OUTBOUND_CAPACITY: usize = 1000;
pub const WEBSOCKET_READ_TIMEOUT: Duration = Duration::from_millis(50);

pub trait Peer: Send + Sync + 'static {
    fn id(&self) -> PublicKey;

    /// The address the remote end said it can be dialed on.
    fn bind_address(&self) -> &str;

    /// Queue a complete frame without blocking. Frames are dropped while the outbound queue is full.
    fn send(&self, frame: Vec<u8>);

    /// Block until the next packet frame arrives. Keep-alive frames are consumed internally.
    fn read(&self) -> Result<Vec<u8>, PeerError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("invalid handshake: {0}")]
    InvalidHandshake(&'static str),
    #[error("peer is on chain {found}, expected {expected}")]
    InvalidChainID { expected: ChainID, found: ChainID },
    #[error("connected to self")]
    SelfConnection,
    #[error("peer {0} is not allowed on this mesh")]
    NotAllowed(PublicKey),
    #[error("peer closed")]
    PeerClosed,
    #[error("too many transactions in message: {0}")]
    TooManyTransactionInMessage(usize),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// State shared between a peer and its writer thread.
struct Liveness {
    closed: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl Liveness {
    fn new() -> Arc<Liveness> {
        Arc::new(Liveness {
            closed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    fn is_silent(&self) -> bool {
        self.last_seen.lock().unwrap().elapsed() > SILENCE_TIMEOUT
    }
}

/// A TCP peer with an asynchronous writer, used on the node and observer meshes.
pub struct TcpAsyncPeer {
    id: PublicKey,
    bind_address: String,
    stream: TcpStream,
    reader: Mutex<TcpStream>,
    outbound: SyncSender<Vec<u8>>,
    liveness: Arc<Liveness>,
}

impl TcpAsyncPeer {
    pub fn new(stream: TcpStream, outcome: HandshakeOutcome) -> Result<Arc<TcpAsyncPeer>, PeerError> {
        let reader = stream.try_clone()?;
        let mut writer = stream.try_clone()?;
        let shutdown_handle = stream.try_clone()?;
        let (outbound, outbound_queue) = mpsc::sync_channel::<Vec<u8>>(OUTBOUND_CAPACITY);
        let liveness = Liveness::new();

        let writer_liveness = liveness.clone();
        thread::spawn(move || {
            let mut last_write = Instant::now();
            loop {
                if writer_liveness.closed.load(Ordering::Acquire) {
                    return;
                }
                let result = match outbound_queue.recv_timeout(Duration::from_secs(1)) {
                    Ok(frame) => writer.write_all(&frame),
                    Err(RecvTimeoutError::Timeout) if last_write.elapsed() >= PING_INTERVAL => {
                        writer.write_all(&ping_frame())
                    }
                    Err(RecvTimeoutError::Timeout) => Ok(()),
                    Err(RecvTimeoutError::Disconnected) => return,
                };
                match result {
                    Ok(()) => last_write = Instant::now(),
                    Err(_) => break,
                }
                if writer_liveness.is_silent() {
                    break;
                }
            }
            writer_liveness.closed.store(true, Ordering::Release);
            let _ = shutdown_handle.shutdown(Shutdown::Both);
        });

        Ok(Arc::new(TcpAsyncPeer {
            id: outcome.public_key,
            bind_address: outcome.bind_address,
            stream,
            reader: Mutex::new(reader),
            outbound,
            liveness,
        }))
    }
}

impl Peer for TcpAsyncPeer {
    fn id(&self) -> PublicKey {
        self.id
    }

    fn bind_address(&self) -> &str {
        &self.bind_address
    }

    fn send(&self, frame: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        if let Err(TrySendError::Full(_)) = self.outbound.try_send(frame) {
            log::debug!("OutboundFull, {}", self.id);
        }
    }

    fn read(&self) -> Result<Vec<u8>, PeerError> {
        let mut reader = self.reader.lock().unwrap();
        loop {
            if self.is_closed() {
                return Err(PeerError::PeerClosed);
            }
            match read_frame(&mut *reader) {
                Ok(Frame::Ping) => self.liveness.touch(),
                Ok(Frame::Packet(frame)) => {
                    self.liveness.touch();
                    return Ok(frame);
                }
                Err(err) => {
                    self.close();
                    return Err(err.into());
                }
            }
        }
    }

    fn close(&self) {
        self.liveness.closed.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn is_closed(&self) -> bool {
        self.liveness.closed.load(Ordering::Acquire)
    }
}

/// A WebSocket peer, used on the link between generators and observers.
///
/// Reads and writes share one socket, so reads poll with a [`WEBSOCKET_READ_TIMEOUT`] to let the writer
/// thread in between.
pub struct WebsocketPeer {
    id: PublicKey,
    bind_address: String,
    raw: TcpStream,
    socket: Arc<Mutex<WebSocket<TcpStream>>>,
    outbound: SyncSender<Vec<u8>>,
    liveness: Arc<Liveness>,
}

impl WebsocketPeer {
    pub fn new(
        socket: WebSocket<TcpStream>,
        outcome: HandshakeOutcome,
    ) -> Result<Arc<WebsocketPeer>, PeerError> {
        let raw = socket.get_ref().try_clone()?;
        raw.set_read_timeout(Some(WEBSOCKET_READ_TIMEOUT))?;
        let socket = Arc::new(Mutex::new(socket));
        let (outbound, outbound_queue) = mpsc::sync_channel::<Vec<u8>>(OUTBOUND_CAPACITY);
        let liveness = Liveness::new();

        let writer_socket = socket.clone();
        let writer_liveness = liveness.clone();
        let shutdown_handle = raw.try_clone()?;
        thread::spawn(move || {
            let mut last_write = Instant::now();
            loop {
                if writer_liveness.closed.load(Ordering::Acquire) {
                    return;
                }
                let frame = match outbound_queue.recv_timeout(WEBSOCKET_READ_TIMEOUT) {
                    Ok(frame) => Some(frame),
                    Err(RecvTimeoutError::Timeout) if last_write.elapsed() >= PING_INTERVAL => {
                        Some(ping_frame().to_vec())
                    }
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                };
                if let Some(frame) = frame {
                    if writer_socket.lock().unwrap().send(Message::Binary(frame)).is_err() {
                        break;
                    }
                    last_write = Instant::now();
                }
                if writer_liveness.is_silent() {
                    break;
                }
            }
            writer_liveness.closed.store(true, Ordering::Release);
            let _ = shutdown_handle.shutdown(Shutdown::Both);
        });

        Ok(Arc::new(WebsocketPeer {
            id: outcome.public_key,
            bind_address: outcome.bind_address,
            raw,
            socket,
            outbound,
            liveness,
        }))
    }
}

impl Peer for WebsocketPeer {
    fn id(&self) -> PublicKey {
        self.id
    }

    fn bind_address(&self) -> &str {
        &self.bind_address
    }

    fn send(&self, frame: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        if let Err(TrySendError::Full(_)) = self.outbound.try_send(frame) {
            log::debug!("OutboundFull, {}", self.id);
        }
    }

    fn read(&self) -> Result<Vec<u8>, PeerError> {
        loop {
            if self.is_closed() {
                return Err(PeerError::PeerClosed);
            }
            let message = self.socket.lock().unwrap().read();
            match message {
                Ok(Message::Binary(frame)) => {
                    self.liveness.touch();
                    if frame[..] != ping_frame() {
                        return Ok(frame);
                    }
                }
                Ok(Message::Close(_)) => {
                    self.close();
                    return Err(PeerError::PeerClosed);
                }
                Ok(_) => self.liveness.touch(),
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    thread::yield_now()
                }
                Err(err) => {
                    self.close();
                    return Err(err.into());
                }
            }
        }
    }

    fn close(&self) {
        self.liveness.closed.store(true, Ordering::Release);
        let _ = self.raw.shutdown(Shutdown::Both);
    }

    fn is_closed(&self) -> bool {
        self.liveness.closed.load(Ordering::Acquire)
    }
}
