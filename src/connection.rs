//! Pipelined connection to a Redis-compatible server.
//!
//! A connection owns one duplex TCP stream. Commands are written without
//! waiting for earlier replies; a FIFO of pending requests correlates each
//! incoming reply with the command that caused it. Once the connection
//! enters subscriber mode, incoming frames are partitioned into push
//! frames (messages and subscription confirmations, dispatched to user
//! callbacks) and ordinary replies (which keep consuming the FIFO), and
//! only a small allowlist of commands may be issued.
//!
//! A spawned reader task owns the read half, the parse buffer, and all
//! callback dispatch, so callbacks for one connection run in arrival order
//! and never concurrently. A second task owns the write half and drains a
//! queue of encoded commands; a request's slot in the reply FIFO and its
//! payload enter that queue under one lock, so wire order always equals
//! FIFO order and a caller dropping its future cannot cancel a write
//! halfway through.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::resp::{encode_command, RespError, RespValue};
use crate::subscriptions::{
    MessageHandler, MessageReceiver, PatternMessageHandler, SubscriptionChangeHandler,
    SubscriptionEntry, SubscriptionKind, SubscriptionTracker,
};

/// Commands the server accepts from a subscribed connection.
///
/// Everything else is rejected locally with
/// [`ConnectionError::PubSubMode`] and never reaches the socket.
const PUB_SUB_ALLOWED_COMMANDS: [&str; 7] = [
    "SUBSCRIBE",
    "PSUBSCRIBE",
    "UNSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
    "RESET",
];

const LOCK_MSG: &str = "connection state lock poisoned";

/// Errors surfaced by connection operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("connection closed")]
    Closed,
    #[error("RESP protocol error: {0}")]
    Protocol(#[from] RespError),
    #[error("command {0} is not allowed while subscribed")]
    PubSubMode(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected response type")]
    UnexpectedResponse,
}

/// Lifecycle of a connection.
///
/// `PubSub` is entered when the first SUBSCRIBE or PSUBSCRIBE is written
/// and left when the last confirmed subscription is removed. `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionStatus {
    Normal,
    PubSub,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfirmationAction {
    Subscribe,
    Unsubscribe,
}

/// One in-flight (P)SUBSCRIBE or (P)UNSUBSCRIBE awaiting its push
/// confirmations.
///
/// The server confirms each name with its own push frame; `remaining`
/// counts down and `done` resolves the caller's future at zero. For
/// subscribes, `staged` holds the entries to install in the tracker as
/// each confirmation arrives.
struct PendingConfirmation {
    action: ConfirmationAction,
    kind: SubscriptionKind,
    staged: HashMap<Vec<u8>, SubscriptionEntry>,
    remaining: usize,
    done: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

/// State shared between the caller-facing handle and the reader task.
struct Shared {
    status: ConnectionStatus,
    pending_replies: VecDeque<oneshot::Sender<Result<RespValue, ConnectionError>>>,
    pending_confirmations: VecDeque<PendingConfirmation>,
    subscriptions: SubscriptionTracker,
}

/// Work for the writer task.
enum WriterCommand {
    /// Write one encoded command.
    Write(Vec<u8>),
    /// Write one final payload, then shut the socket down.
    Shutdown(Vec<u8>),
}

/// An asynchronous, pipelined client connection.
///
/// All methods take `&self`; the connection is safe to share behind an
/// `Arc`. Two `send` calls from the same caller complete in call order.
pub struct Connection {
    shared: Arc<Mutex<Shared>>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    reader_handle: JoinHandle<()>,
}

impl Connection {
    /// Wraps an established stream and spawns its reader task on the
    /// current Tokio runtime.
    ///
    /// Accepting a ready-made stream is the transport seam: TLS or other
    /// wrappers can be dialed by the caller before handing the stream in.
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();

        let shared = Arc::new(Mutex::new(Shared {
            status: ConnectionStatus::Normal,
            pending_replies: VecDeque::new(),
            pending_confirmations: VecDeque::new(),
            subscriptions: SubscriptionTracker::new(),
        }));

        let reader_shared = Arc::clone(&shared);
        let reader_handle = tokio::spawn(async move {
            read_loop(reader, reader_shared).await;
        });

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            write_loop(writer, writer_rx, writer_shared).await;
        });

        Connection {
            shared,
            writer_tx,
            reader_handle,
        }
    }

    /// Dials `address` and wraps the resulting stream.
    pub async fn connect(address: &str) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|error| ConnectionError::Io(error.to_string()))?;

        Ok(Connection::new(stream))
    }

    /// Sends one command and resolves with its reply.
    ///
    /// The command is pipelined: the write happens immediately and the
    /// returned future resolves when the matching reply arrives. Server
    /// `-ERR` replies surface as [`ConnectionError::Server`] without
    /// affecting the connection.
    ///
    /// # Arguments
    ///
    /// * `command` - Command name; the case used on the wire is uppercase
    /// * `args` - Raw command arguments
    ///
    /// # Returns
    ///
    /// * `Ok(RespValue)` - The server's reply
    /// * `Err(ConnectionError::Closed)` - The connection is closed
    /// * `Err(ConnectionError::PubSubMode)` - The command is not allowed
    ///   while subscribed and was not sent
    pub async fn send(&self, command: &str, args: &[&[u8]]) -> Result<RespValue, ConnectionError> {
        let command = command.to_ascii_uppercase();

        let mut frame: Vec<&[u8]> = Vec::with_capacity(args.len() + 1);
        frame.push(command.as_bytes());
        frame.extend_from_slice(args);

        let mut payload = Vec::new();
        encode_command(&frame, &mut payload);

        // The FIFO slot and the payload enter the writer queue under one
        // lock, so reply order always matches wire order.
        let receiver = {
            let mut guard = self.shared.lock().expect(LOCK_MSG);

            match guard.status {
                ConnectionStatus::Closed => return Err(ConnectionError::Closed),
                ConnectionStatus::PubSub if !is_allowed_while_subscribed(&command) => {
                    return Err(ConnectionError::PubSubMode(command));
                }
                _ => {}
            }

            let (sender, receiver) = oneshot::channel();
            guard.pending_replies.push_back(sender);

            if self.writer_tx.send(WriterCommand::Write(payload)).is_err() {
                guard.pending_replies.pop_back();
                return Err(ConnectionError::Closed);
            }

            receiver
        };

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Closed),
        }
    }

    /// Subscribes to one or more channels.
    ///
    /// The future resolves once the server has confirmed every channel.
    /// `handler` runs for each message published to any of them;
    /// `on_subscribe` and `on_unsubscribe` run on the matching
    /// confirmations, all on this connection's reader task.
    pub async fn subscribe(
        &self,
        channels: &[&[u8]],
        handler: MessageHandler,
        on_subscribe: Option<SubscriptionChangeHandler>,
        on_unsubscribe: Option<SubscriptionChangeHandler>,
    ) -> Result<(), ConnectionError> {
        let staged = channels
            .iter()
            .map(|name| {
                (
                    name.to_vec(),
                    SubscriptionEntry {
                        receiver: MessageReceiver::Channel(Arc::clone(&handler)),
                        on_subscribe: on_subscribe.clone(),
                        on_unsubscribe: on_unsubscribe.clone(),
                    },
                )
            })
            .collect();

        self.request_subscribe(SubscriptionKind::Channel, b"SUBSCRIBE", channels, staged)
            .await
    }

    /// Subscribes to one or more glob patterns.
    ///
    /// The pattern syntax is the server's; the client forwards it
    /// verbatim. `handler` receives the pattern, the concrete channel, and
    /// the payload.
    pub async fn psubscribe(
        &self,
        patterns: &[&[u8]],
        handler: PatternMessageHandler,
        on_subscribe: Option<SubscriptionChangeHandler>,
        on_unsubscribe: Option<SubscriptionChangeHandler>,
    ) -> Result<(), ConnectionError> {
        let staged = patterns
            .iter()
            .map(|name| {
                (
                    name.to_vec(),
                    SubscriptionEntry {
                        receiver: MessageReceiver::Pattern(Arc::clone(&handler)),
                        on_subscribe: on_subscribe.clone(),
                        on_unsubscribe: on_unsubscribe.clone(),
                    },
                )
            })
            .collect();

        self.request_subscribe(SubscriptionKind::Pattern, b"PSUBSCRIBE", patterns, staged)
            .await
    }

    /// Unsubscribes from the given channels, or from every channel when
    /// `channels` is empty.
    ///
    /// Pattern subscriptions are unaffected. Names without a confirmed
    /// subscription are skipped; when nothing remains the call resolves
    /// locally without a round trip.
    pub async fn unsubscribe(&self, channels: &[&[u8]]) -> Result<(), ConnectionError> {
        self.request_unsubscribe(SubscriptionKind::Channel, b"UNSUBSCRIBE", channels)
            .await
    }

    /// Unsubscribes from the given patterns, or from every pattern when
    /// `patterns` is empty.
    pub async fn punsubscribe(&self, patterns: &[&[u8]]) -> Result<(), ConnectionError> {
        self.request_unsubscribe(SubscriptionKind::Pattern, b"PUNSUBSCRIBE", patterns)
            .await
    }

    /// Closes the connection and fails every pending request.
    ///
    /// A `QUIT` is written on a best-effort basis before the socket is
    /// shut down; the server's reply is not awaited. Subscription
    /// callbacks are not fired: teardown is not a logical unsubscribe.
    pub async fn close(&self) {
        let already_closed = {
            let guard = self.shared.lock().expect(LOCK_MSG);
            guard.status == ConnectionStatus::Closed
        };

        if !already_closed {
            let mut payload = Vec::new();
            encode_command(&[b"QUIT"], &mut payload);
            let _ = self.writer_tx.send(WriterCommand::Shutdown(payload));
        }

        teardown(&self.shared, ConnectionError::Closed);
        self.reader_handle.abort();
    }

    /// True while the connection holds at least one confirmed channel or
    /// pattern subscription.
    ///
    /// Derived from the subscription tracker on every call, never cached.
    pub fn is_subscribed(&self) -> bool {
        let guard = self.shared.lock().expect(LOCK_MSG);
        guard.subscriptions.is_subscribed()
    }

    /// True once the connection has been closed or torn down.
    pub fn is_closed(&self) -> bool {
        let guard = self.shared.lock().expect(LOCK_MSG);
        guard.status == ConnectionStatus::Closed
    }

    async fn request_subscribe(
        &self,
        kind: SubscriptionKind,
        command: &[u8],
        names: &[&[u8]],
        staged: HashMap<Vec<u8>, SubscriptionEntry>,
    ) -> Result<(), ConnectionError> {
        if names.is_empty() {
            return Ok(());
        }

        let mut frame: Vec<&[u8]> = Vec::with_capacity(names.len() + 1);
        frame.push(command);
        frame.extend_from_slice(names);

        let mut payload = Vec::new();
        encode_command(&frame, &mut payload);

        let receiver = {
            let mut guard = self.shared.lock().expect(LOCK_MSG);

            if guard.status == ConnectionStatus::Closed {
                return Err(ConnectionError::Closed);
            }

            // The first subscription flips the connection into subscriber
            // mode; confirmations arrive later as push frames.
            if guard.status == ConnectionStatus::Normal {
                guard.status = ConnectionStatus::PubSub;
            }

            let (sender, receiver) = oneshot::channel();
            guard.pending_confirmations.push_back(PendingConfirmation {
                action: ConfirmationAction::Subscribe,
                kind,
                staged,
                remaining: names.len(),
                done: Some(sender),
            });

            if self.writer_tx.send(WriterCommand::Write(payload)).is_err() {
                guard.pending_confirmations.pop_back();
                return Err(ConnectionError::Closed);
            }

            receiver
        };

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Closed),
        }
    }

    async fn request_unsubscribe(
        &self,
        kind: SubscriptionKind,
        command: &[u8],
        names: &[&[u8]],
    ) -> Result<(), ConnectionError> {
        let receiver = {
            let mut guard = self.shared.lock().expect(LOCK_MSG);

            if guard.status == ConnectionStatus::Closed {
                return Err(ConnectionError::Closed);
            }

            // An empty list targets every confirmed subscription of this
            // kind; names without a confirmed subscription are skipped.
            let targets: Vec<Vec<u8>> = if names.is_empty() {
                guard.subscriptions.names(kind)
            } else {
                names
                    .iter()
                    .filter(|name| guard.subscriptions.contains(kind, name))
                    .map(|name| name.to_vec())
                    .collect()
            };

            // Nothing confirmed server-side: resolve locally, no round
            // trip.
            if targets.is_empty() {
                return Ok(());
            }

            let mut frame: Vec<&[u8]> = Vec::with_capacity(targets.len() + 1);
            frame.push(command);
            frame.extend(targets.iter().map(|name| name.as_slice()));

            let mut payload = Vec::new();
            encode_command(&frame, &mut payload);

            let (sender, receiver) = oneshot::channel();
            guard.pending_confirmations.push_back(PendingConfirmation {
                action: ConfirmationAction::Unsubscribe,
                kind,
                staged: HashMap::new(),
                remaining: targets.len(),
                done: Some(sender),
            });

            if self.writer_tx.send(WriterCommand::Write(payload)).is_err() {
                guard.pending_confirmations.pop_back();
                return Err(ConnectionError::Closed);
            }

            receiver
        };

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Closed),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn is_allowed_while_subscribed(command: &str) -> bool {
    PUB_SUB_ALLOWED_COMMANDS.contains(&command)
}

async fn write_to_stream(
    writer: &mut OwnedWriteHalf,
    payload: &[u8],
) -> Result<(), std::io::Error> {
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Drains the write queue onto the socket.
///
/// A write error is fatal; the loop also ends when every handle to the
/// connection is gone (the queue closes) or a shutdown command arrives.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<WriterCommand>,
    shared: Arc<Mutex<Shared>>,
) {
    while let Some(command) = queue.recv().await {
        match command {
            WriterCommand::Write(payload) => {
                if let Err(error) = write_to_stream(&mut writer, &payload).await {
                    teardown(&shared, ConnectionError::Io(error.to_string()));
                    return;
                }
            }
            WriterCommand::Shutdown(payload) => {
                let _ = write_to_stream(&mut writer, &payload).await;
                let _ = writer.shutdown().await;
                return;
            }
        }
    }

    let _ = writer.shutdown().await;
}

/// Reads frames off the socket until EOF, an I/O error, or a protocol
/// error, dispatching each completed frame.
async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Mutex<Shared>>) {
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!("server closed the connection");
                teardown(&shared, ConnectionError::Closed);
                return;
            }
            Ok(_) => {}
            Err(error) => {
                teardown(&shared, ConnectionError::Io(error.to_string()));
                return;
            }
        }

        loop {
            match RespValue::parse(&buffer) {
                Ok(Some((frame, consumed))) => {
                    buffer.advance(consumed);
                    dispatch_frame(&shared, frame);
                }
                Ok(None) => break,
                Err(error) => {
                    warn!("protocol error, tearing down connection: {}", error);
                    teardown(&shared, ConnectionError::Protocol(error));
                    return;
                }
            }
        }
    }
}

/// A push frame delivered while subscribed, decoded into its parts.
enum PushFrame {
    Message {
        channel: Vec<u8>,
        payload: Vec<u8>,
    },
    PatternMessage {
        pattern: Vec<u8>,
        channel: Vec<u8>,
        payload: Vec<u8>,
    },
    Confirmation {
        action: ConfirmationAction,
        kind: SubscriptionKind,
        name: Option<Vec<u8>>,
        count: i64,
    },
}

enum InboundFrame {
    Reply(RespValue),
    Push(PushFrame),
    MalformedPush,
}

/// Partitions an inbound frame by its leading array element.
///
/// Only meaningful while subscribed; in normal mode every frame is a
/// reply regardless of shape.
fn classify_inbound(frame: RespValue) -> InboundFrame {
    let is_push_name = match &frame {
        RespValue::Array(Some(items)) => items
            .first()
            .and_then(|item| item.as_bytes())
            .map(|name| {
                matches!(
                    name.to_ascii_lowercase().as_slice(),
                    b"message"
                        | b"pmessage"
                        | b"subscribe"
                        | b"psubscribe"
                        | b"unsubscribe"
                        | b"punsubscribe"
                )
            })
            .unwrap_or(false),
        _ => false,
    };

    if !is_push_name {
        return InboundFrame::Reply(frame);
    }

    match parse_push(frame) {
        Some(push) => InboundFrame::Push(push),
        None => InboundFrame::MalformedPush,
    }
}

fn parse_push(frame: RespValue) -> Option<PushFrame> {
    let RespValue::Array(Some(mut items)) = frame else {
        return None;
    };

    let kind = items.first()?.as_bytes()?.to_ascii_lowercase();

    match kind.as_slice() {
        b"message" => {
            if items.len() != 3 {
                return None;
            }
            let payload = bulk_bytes(items.pop()?)?;
            let channel = bulk_bytes(items.pop()?)?;
            Some(PushFrame::Message { channel, payload })
        }
        b"pmessage" => {
            if items.len() != 4 {
                return None;
            }
            let payload = bulk_bytes(items.pop()?)?;
            let channel = bulk_bytes(items.pop()?)?;
            let pattern = bulk_bytes(items.pop()?)?;
            Some(PushFrame::PatternMessage {
                pattern,
                channel,
                payload,
            })
        }
        b"subscribe" | b"psubscribe" | b"unsubscribe" | b"punsubscribe" => {
            if items.len() != 3 {
                return None;
            }
            let count = items.pop()?.as_integer()?;
            // The name may be null: UNSUBSCRIBE with nothing subscribed is
            // confirmed with a null channel field.
            let name = match items.pop()? {
                RespValue::BulkString(Some(data)) => Some(data),
                RespValue::BulkString(None) => None,
                _ => return None,
            };

            let (action, subscription_kind) = match kind.as_slice() {
                b"subscribe" => (ConfirmationAction::Subscribe, SubscriptionKind::Channel),
                b"psubscribe" => (ConfirmationAction::Subscribe, SubscriptionKind::Pattern),
                b"unsubscribe" => (ConfirmationAction::Unsubscribe, SubscriptionKind::Channel),
                _ => (ConfirmationAction::Unsubscribe, SubscriptionKind::Pattern),
            };

            Some(PushFrame::Confirmation {
                action,
                kind: subscription_kind,
                name,
                count,
            })
        }
        _ => None,
    }
}

fn bulk_bytes(value: RespValue) -> Option<Vec<u8>> {
    match value {
        RespValue::BulkString(Some(data)) => Some(data),
        RespValue::SimpleString(text) => Some(text.into_bytes()),
        _ => None,
    }
}

fn dispatch_frame(shared: &Arc<Mutex<Shared>>, frame: RespValue) {
    let in_pub_sub = {
        let guard = shared.lock().expect(LOCK_MSG);
        guard.status == ConnectionStatus::PubSub
    };

    if !in_pub_sub {
        resolve_reply(shared, frame);
        return;
    }

    match classify_inbound(frame) {
        InboundFrame::Reply(frame) => resolve_reply(shared, frame),
        InboundFrame::Push(push) => handle_push(shared, push),
        InboundFrame::MalformedPush => {
            warn!("ignoring malformed push frame");
        }
    }
}

/// Matches a non-push frame to the oldest pending request.
fn resolve_reply(shared: &Arc<Mutex<Shared>>, frame: RespValue) {
    let sender = {
        let mut guard = shared.lock().expect(LOCK_MSG);
        guard.pending_replies.pop_front()
    };

    let Some(sender) = sender else {
        warn!("dropping reply with no pending request: {:?}", frame);
        return;
    };

    let result = match frame {
        RespValue::Error(message) => Err(ConnectionError::Server(message)),
        value => Ok(value),
    };

    // The caller may have dropped its future; the reply is consumed from
    // the FIFO and discarded in that case.
    let _ = sender.send(result);
}

fn handle_push(shared: &Arc<Mutex<Shared>>, push: PushFrame) {
    match push {
        PushFrame::Message { channel, payload } => {
            let handler = {
                let guard = shared.lock().expect(LOCK_MSG);
                match guard.subscriptions.get(SubscriptionKind::Channel, &channel) {
                    Some(entry) => match &entry.receiver {
                        MessageReceiver::Channel(handler) => Some(Arc::clone(handler)),
                        MessageReceiver::Pattern(_) => None,
                    },
                    None => None,
                }
            };

            match handler {
                Some(handler) => handler(&channel, &payload),
                None => debug!(
                    "message for channel {:?} with no subscription",
                    String::from_utf8_lossy(&channel)
                ),
            }
        }
        PushFrame::PatternMessage {
            pattern,
            channel,
            payload,
        } => {
            let handler = {
                let guard = shared.lock().expect(LOCK_MSG);
                match guard.subscriptions.get(SubscriptionKind::Pattern, &pattern) {
                    Some(entry) => match &entry.receiver {
                        MessageReceiver::Pattern(handler) => Some(Arc::clone(handler)),
                        MessageReceiver::Channel(_) => None,
                    },
                    None => None,
                }
            };

            match handler {
                Some(handler) => handler(&pattern, &channel, &payload),
                None => debug!(
                    "pmessage for pattern {:?} with no subscription",
                    String::from_utf8_lossy(&pattern)
                ),
            }
        }
        PushFrame::Confirmation {
            action: ConfirmationAction::Subscribe,
            kind,
            name,
            count,
        } => {
            let Some(name) = name else {
                warn!("ignoring subscribe confirmation with null name");
                return;
            };

            let (on_subscribe, done) = {
                let mut guard = shared.lock().expect(LOCK_MSG);

                let mut head_matched = false;
                let mut staged_entry = None;
                let mut done = None;

                if let Some(confirmation) = guard.pending_confirmations.front_mut() {
                    if confirmation.action == ConfirmationAction::Subscribe
                        && confirmation.kind == kind
                    {
                        head_matched = true;
                        staged_entry = confirmation.staged.remove(name.as_slice());

                        confirmation.remaining = confirmation.remaining.saturating_sub(1);
                        if confirmation.remaining == 0 {
                            done = guard
                                .pending_confirmations
                                .pop_front()
                                .and_then(|confirmation| confirmation.done);
                        }
                    }
                }

                let mut on_subscribe = None;
                match staged_entry {
                    Some(entry) => {
                        on_subscribe = entry.on_subscribe.clone();
                        guard.subscriptions.insert(kind, name.clone(), entry);
                    }
                    None if head_matched => {
                        debug!(
                            "subscribe confirmation for unstaged name {:?}",
                            String::from_utf8_lossy(&name)
                        );
                    }
                    None => {
                        debug!("unexpected subscribe confirmation");
                    }
                }

                (on_subscribe, done)
            };

            if let Some(callback) = on_subscribe {
                callback(&name, count);
            }
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
        }
        PushFrame::Confirmation {
            action: ConfirmationAction::Unsubscribe,
            kind,
            name,
            count,
        } => {
            let (on_unsubscribe, done) = {
                let mut guard = shared.lock().expect(LOCK_MSG);
                let mut on_unsubscribe = None;
                let mut done = None;

                if let Some(name) = &name {
                    if let Some(entry) = guard.subscriptions.remove(kind, name) {
                        on_unsubscribe = entry.on_unsubscribe.clone();
                    }

                    if let Some(confirmation) = guard.pending_confirmations.front_mut() {
                        if confirmation.action == ConfirmationAction::Unsubscribe
                            && confirmation.kind == kind
                        {
                            confirmation.remaining = confirmation.remaining.saturating_sub(1);
                            if confirmation.remaining == 0 {
                                done = guard
                                    .pending_confirmations
                                    .pop_front()
                                    .and_then(|confirmation| confirmation.done);
                            }
                        }
                    }
                }

                // Subscriber mode ends only once every confirmed
                // subscription is gone and no pipelined subscribe is still
                // awaiting confirmation.
                let subscribe_pending = guard
                    .pending_confirmations
                    .iter()
                    .any(|confirmation| confirmation.action == ConfirmationAction::Subscribe);

                if guard.status == ConnectionStatus::PubSub
                    && !guard.subscriptions.is_subscribed()
                    && !subscribe_pending
                {
                    guard.status = ConnectionStatus::Normal;
                }

                (on_unsubscribe, done)
            };

            if let (Some(callback), Some(name)) = (on_unsubscribe, &name) {
                callback(name, count);
            }
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
        }
    }
}

/// Moves the connection to `Closed` and fails everything in flight.
///
/// Subscription entries are dropped without firing unsubscribe callbacks;
/// losing the connection is not a logical unsubscribe.
fn teardown(shared: &Arc<Mutex<Shared>>, cause: ConnectionError) {
    let (replies, confirmations) = {
        let mut guard = shared.lock().expect(LOCK_MSG);

        if guard.status == ConnectionStatus::Closed {
            return;
        }

        guard.status = ConnectionStatus::Closed;
        guard.subscriptions.clear();

        (
            std::mem::take(&mut guard.pending_replies),
            std::mem::take(&mut guard.pending_confirmations),
        )
    };

    for sender in replies {
        let _ = sender.send(Err(cause.clone()));
    }

    for confirmation in confirmations {
        if let Some(done) = confirmation.done {
            let _ = done.send(Err(cause.clone()));
        }
    }
}
