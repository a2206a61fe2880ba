//! Stream multiplexer: independent logical streams over one secure channel.
//!
//! Frame layout (inside each encrypted frame):
//!
//! ```text
//! [kind: u8][stream id: u32 BE][payload ...]
//! ```
//!
//! | kind | payload |
//! |------|---------|
//! | `OPEN` | purpose, UTF-8 |
//! | `DATA` | bytes |
//! | `CLOSE` | empty |
//! | `WINDOW` | credit, u32 BE |
//!
//! Every stream starts with [`INITIAL_WINDOW`] frames of send credit. The
//! receiver hands credit back as its consumer reads, so a stalled consumer
//! only stalls its own stream: the demultiplexer never waits on a consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{DecodeError, MuxError};
use crate::link::MAX_FRAME_LEN;
use crate::secure::{Role, SecureChannel, SecureReceiver, SecureSender};

/// Send credit, in frames, each stream starts with.
pub const INITIAL_WINDOW: u32 = 64;

/// Largest payload of a single data frame.
pub const MAX_DATA_LEN: usize = MAX_FRAME_LEN - 64;

const MAX_PURPOSE_LEN: usize = 256;
const HEADER_LEN: usize = 5;

const KIND_OPEN: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_CLOSE: u8 = 2;
const KIND_WINDOW: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Open { id: u32, purpose: String },
    Data { id: u32, data: Vec<u8> },
    Close { id: u32 },
    Window { id: u32, credit: u32 },
}

impl Frame {
    fn encode(&self) -> Vec<u8> {
        let (kind, id, payload): (u8, u32, &[u8]) = match self {
            Frame::Open { id, purpose } => (KIND_OPEN, *id, purpose.as_bytes()),
            Frame::Data { id, data } => (KIND_DATA, *id, data),
            Frame::Close { id } => (KIND_CLOSE, *id, &[]),
            Frame::Window { id, credit } => {
                let mut out = vec![KIND_WINDOW];
                out.extend_from_slice(&id.to_be_bytes());
                out.extend_from_slice(&credit.to_be_bytes());
                return out;
            }
        };
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(kind);
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Frame(format!(
                "mux frame of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let payload = &bytes[HEADER_LEN..];
        match bytes[0] {
            KIND_OPEN => {
                if payload.len() > MAX_PURPOSE_LEN {
                    return Err(DecodeError::TooLarge {
                        size: payload.len(),
                        max: MAX_PURPOSE_LEN,
                    });
                }
                let purpose = String::from_utf8(payload.to_vec())
                    .map_err(|_| DecodeError::Frame("stream purpose is not UTF-8".into()))?;
                Ok(Frame::Open { id, purpose })
            }
            KIND_DATA => Ok(Frame::Data {
                id,
                data: payload.to_vec(),
            }),
            KIND_CLOSE => Ok(Frame::Close { id }),
            KIND_WINDOW => {
                let credit: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| DecodeError::Frame("window frame needs 4 bytes".into()))?;
                Ok(Frame::Window {
                    id,
                    credit: u32::from_be_bytes(credit),
                })
            }
            other => Err(DecodeError::Frame(format!("unknown mux frame kind {other}"))),
        }
    }
}

enum Command {
    Frame(Frame),
    Shutdown,
}

struct StreamSlot {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    credit: Arc<Semaphore>,
}

struct Shared {
    role: Role,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<MuxStream>>>,
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU32,
    closed: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn new_stream(self: &Arc<Self>, id: u32, purpose: String) -> MuxStream {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(INITIAL_WINDOW as usize));
        self.streams.lock().insert(
            id,
            StreamSlot {
                inbound: inbound_tx,
                credit: Arc::clone(&credit),
            },
        );
        MuxStream {
            id,
            purpose,
            inbound: inbound_rx,
            credit,
            commands: self.commands.clone(),
            shared: Arc::downgrade(self),
            consumed: 0,
            closed: false,
        }
    }

    /// Ids we allocate are odd on the dialing side and even on the other.
    fn is_remote_id(&self, id: u32) -> bool {
        let ours_odd = self.role == Role::Initiator;
        (id % 2 == 1) != ours_odd
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Open { id, purpose } => {
                if !self.is_remote_id(id) || self.streams.lock().contains_key(&id) {
                    warn!("Ignoring open of invalid stream id {id}");
                    return;
                }
                trace!("Remote opened stream {id} ({purpose})");
                let stream = self.new_stream(id, purpose);
                let accept_tx = self.accept_tx.lock().clone();
                if let Some(tx) = accept_tx {
                    let _ = tx.send(stream);
                }
            }
            Frame::Data { id, data } => {
                let streams = self.streams.lock();
                match streams.get(&id) {
                    Some(slot) => {
                        let _ = slot.inbound.send(data);
                    }
                    None => trace!("Data for unknown stream {id}"),
                }
            }
            Frame::Close { id } => {
                if let Some(slot) = self.streams.lock().remove(&id) {
                    slot.credit.close();
                    trace!("Remote closed stream {id}");
                }
            }
            Frame::Window { id, credit } => {
                if let Some(slot) = self.streams.lock().get(&id) {
                    slot.credit.add_permits(credit as usize);
                }
            }
        }
    }

    /// Close the connection: every stream, the accept queue, and the link.
    fn teardown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let slots: Vec<StreamSlot> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.credit.close();
        }
        self.accept_tx.lock().take();
        let _ = self.commands.send(Command::Shutdown);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        debug!("Multiplexer torn down");
    }
}

/// Closes the connection when the last [`Multiplexer`] handle is dropped.
struct CloseGuard(Arc<Shared>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

/// Handle to a multiplexed connection. Cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
    accept_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<MuxStream>>>,
    _guard: Arc<CloseGuard>,
}

impl Multiplexer {
    /// Attach a multiplexer to an established channel and start its reader
    /// and writer tasks.
    pub fn new(channel: SecureChannel, role: Role) -> Self {
        let (receiver, sender) = channel.split();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            role,
            streams: Mutex::new(HashMap::new()),
            accept_tx: Mutex::new(Some(accept_tx)),
            commands: cmd_tx,
            next_id: AtomicU32::new(if role == Role::Initiator { 1 } else { 2 }),
            closed: closed_tx,
            reader: Mutex::new(None),
        });

        tokio::spawn(writer_loop(sender, cmd_rx, Arc::downgrade(&shared)));
        let reader = tokio::spawn(reader_loop(receiver, Arc::clone(&shared)));
        *shared.reader.lock() = Some(reader);

        Self {
            _guard: Arc::new(CloseGuard(Arc::clone(&shared))),
            shared,
            accept_rx: Arc::new(AsyncMutex::new(accept_rx)),
        }
    }

    /// Open a new outbound stream tagged with `purpose`.
    pub fn open_stream(&self, purpose: &str) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed);
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.new_stream(id, purpose.to_string());
        self.shared
            .commands
            .send(Command::Frame(Frame::Open {
                id,
                purpose: purpose.to_string(),
            }))
            .map_err(|_| MuxError::ConnectionClosed)?;
        Ok(stream)
    }

    /// Wait for the remote to open a stream. `None` once the connection is
    /// closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Close the connection, force-closing every stream.
    pub fn close(&self) {
        self.shared.teardown();
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the connection is closed from either side.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of open streams.
    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }
}

async fn reader_loop(mut receiver: SecureReceiver, shared: Arc<Shared>) {
    loop {
        match receiver.recv().await {
            Ok(Some(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => shared.dispatch(frame),
                Err(e) => {
                    warn!("Closing connection after bad mux frame: {e}");
                    break;
                }
            },
            Ok(None) => {
                debug!("Connection closed by remote");
                break;
            }
            Err(e) => {
                debug!("Connection read failed: {e}");
                break;
            }
        }
    }
    // Reader is finishing on its own; do not abort ourselves.
    shared.reader.lock().take();
    shared.teardown();
}

async fn writer_loop(
    mut sender: SecureSender,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: Weak<Shared>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Frame(frame) => {
                if let Err(e) = sender.send(&frame.encode()).await {
                    debug!("Connection write failed: {e}");
                    break;
                }
            }
            Command::Shutdown => break,
        }
    }
    sender.close().await;
    if let Some(shared) = shared.upgrade() {
        shared.teardown();
    }
}

/// One logical stream of a [`Multiplexer`].
///
/// Dropping the stream closes it.
pub struct MuxStream {
    id: u32,
    purpose: String,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    credit: Arc<Semaphore>,
    commands: mpsc::UnboundedSender<Command>,
    shared: Weak<Shared>,
    consumed: u32,
    closed: bool,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Send one message, waiting for credit if the remote has not caught up.
    pub async fn send(&self, data: &[u8]) -> Result<(), MuxError> {
        if data.len() > MAX_DATA_LEN {
            return Err(MuxError::FrameTooLarge(data.len()));
        }
        let permit = self
            .credit
            .acquire()
            .await
            .map_err(|_| MuxError::StreamClosed(self.id))?;
        permit.forget();
        self.commands
            .send(Command::Frame(Frame::Data {
                id: self.id,
                data: data.to_vec(),
            }))
            .map_err(|_| MuxError::ConnectionClosed)
    }

    /// Receive the next message. `None` once the stream or connection is
    /// closed and everything buffered has been read.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let data = self.inbound.recv().await?;
        self.consumed += 1;
        if self.consumed >= INITIAL_WINDOW / 2 {
            let _ = self.commands.send(Command::Frame(Frame::Window {
                id: self.id,
                credit: self.consumed,
            }));
            self.consumed = 0;
        }
        Some(data)
    }

    /// Close this stream only; the connection stays up.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.credit.close();
        if let Some(shared) = self.shared.upgrade() {
            shared.streams.lock().remove(&self.id);
        }
        let _ = self
            .commands
            .send(Command::Frame(Frame::Close { id: self.id }));
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("purpose", &self.purpose)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) async fn mux_pair() -> (Multiplexer, Multiplexer) {
    use crate::identity::NodeIdentity;
    use crate::secure::Handshake;

    let a = NodeIdentity::generate();
    let b = NodeIdentity::generate();
    let (la, lb) = crate::link::tcp_pair().await;
    let (ca, cb) = tokio::join!(
        Handshake::new(&a, Role::Initiator).run(la),
        Handshake::new(&b, Role::Responder).run(lb)
    );
    (
        Multiplexer::new(ca.unwrap(), Role::Initiator),
        Multiplexer::new(cb.unwrap(), Role::Responder),
    )
}
