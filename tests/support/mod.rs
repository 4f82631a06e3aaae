//! Minimal in-process Redis-compatible server for the integration tests.
//!
//! Speaks just enough RESP2 to exercise the client: string and list
//! basics, AUTH, and the full Pub/Sub subprotocol including pattern
//! delivery. Each accepted connection is handled on its own task; push
//! frames are written straight to the subscriber sockets, exactly like a
//! real server interleaves them with replies.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use globset::Glob;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use redlink::resp::RespValue;

type SharedWriter = Arc<RwLock<OwnedWriteHalf>>;

#[derive(Default)]
struct ClientSubscriptions {
    channels: HashSet<Vec<u8>>,
    patterns: HashSet<Vec<u8>>,
}

#[derive(Default)]
struct ServerState {
    store: HashMap<Vec<u8>, Vec<u8>>,
    lists: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    channels: HashMap<Vec<u8>, HashMap<u64, SharedWriter>>,
    patterns: HashMap<Vec<u8>, HashMap<u64, SharedWriter>>,
    subscriptions: HashMap<u64, ClientSubscriptions>,
}

pub struct MockServer {
    pub address: String,
    accept_handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with_password(None).await
    }

    pub async fn start_with_password(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let state = Arc::new(Mutex::new(ServerState::default()));
        let next_client_id = Arc::new(AtomicU64::new(0));

        let accept_handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let client_id = next_client_id.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&state);
                let password = password.clone();

                tokio::spawn(async move {
                    handle_client(stream, state, client_id, password).await;
                });
            }
        });

        MockServer {
            address,
            accept_handle,
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<Mutex<ServerState>>,
    client_id: u64,
    password: Option<String>,
) {
    let (mut reader, writer) = stream.into_split();
    let writer: SharedWriter = Arc::new(RwLock::new(writer));

    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut authenticated = password.is_none();

    'outer: loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(_) => break,
        };
        buffer.extend_from_slice(&chunk[..read]);

        loop {
            match RespValue::parse(&buffer) {
                Ok(Some((frame, consumed))) => {
                    buffer.drain(..consumed);

                    let keep_going = dispatch_command(
                        frame,
                        &writer,
                        &state,
                        client_id,
                        &password,
                        &mut authenticated,
                    )
                    .await;

                    if !keep_going {
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    let _ = write_frame(
                        &writer,
                        &RespValue::Error("ERR Protocol error".to_string()),
                    )
                    .await;
                    break 'outer;
                }
            }
        }
    }

    cleanup_client(&state, client_id).await;
}

async fn dispatch_command(
    frame: RespValue,
    writer: &SharedWriter,
    state: &Arc<Mutex<ServerState>>,
    client_id: u64,
    password: &Option<String>,
    authenticated: &mut bool,
) -> bool {
    let Some(parts) = command_parts(frame) else {
        let _ = write_frame(
            writer,
            &RespValue::Error("ERR unknown command".to_string()),
        )
        .await;
        return true;
    };

    let name = parts[0].to_ascii_uppercase();
    let args = &parts[1..];

    if !*authenticated && name != b"AUTH" && name != b"QUIT" {
        let _ = write_frame(
            writer,
            &RespValue::Error("NOAUTH Authentication required.".to_string()),
        )
        .await;
        return true;
    }

    match name.as_slice() {
        b"PING" => {
            let reply = match args.first() {
                Some(payload) => RespValue::BulkString(Some(payload.clone())),
                None => RespValue::SimpleString("PONG".to_string()),
            };
            let _ = write_frame(writer, &reply).await;
        }
        b"ECHO" => {
            let reply = match args.first() {
                Some(message) => RespValue::BulkString(Some(message.clone())),
                None => RespValue::Error("ERR wrong number of arguments".to_string()),
            };
            let _ = write_frame(writer, &reply).await;
        }
        b"AUTH" => {
            let reply = match (password, args.first()) {
                (Some(expected), Some(given)) if expected.as_bytes() == given.as_slice() => {
                    *authenticated = true;
                    RespValue::SimpleString("OK".to_string())
                }
                (Some(_), _) => {
                    RespValue::Error("ERR invalid password".to_string())
                }
                (None, _) => RespValue::Error(
                    "ERR Client sent AUTH, but no password is set".to_string(),
                ),
            };
            let _ = write_frame(writer, &reply).await;
        }
        b"GET" => {
            let reply = match args.first() {
                Some(key) => {
                    let guard = state.lock().await;
                    RespValue::BulkString(guard.store.get(key.as_slice()).cloned())
                }
                None => RespValue::Error("ERR wrong number of arguments".to_string()),
            };
            let _ = write_frame(writer, &reply).await;
        }
        b"SET" => {
            let reply = if args.len() == 2 {
                let mut guard = state.lock().await;
                guard.store.insert(args[0].clone(), args[1].clone());
                RespValue::SimpleString("OK".to_string())
            } else {
                RespValue::Error("ERR wrong number of arguments".to_string())
            };
            let _ = write_frame(writer, &reply).await;
        }
        b"DEL" => {
            let mut guard = state.lock().await;
            let mut removed = 0;
            for key in args {
                if guard.store.remove(key.as_slice()).is_some() {
                    removed += 1;
                }
            }
            drop(guard);
            let _ = write_frame(writer, &RespValue::Integer(removed)).await;
        }
        b"LPUSH" => {
            let reply = if args.len() >= 2 {
                let mut guard = state.lock().await;
                let list = guard.lists.entry(args[0].clone()).or_default();
                for value in &args[1..] {
                    list.insert(0, value.clone());
                }
                RespValue::Integer(list.len() as i64)
            } else {
                RespValue::Error("ERR wrong number of arguments".to_string())
            };
            let _ = write_frame(writer, &reply).await;
        }
        b"SUBSCRIBE" => {
            handle_subscribe(state, client_id, writer, args, true).await;
        }
        b"PSUBSCRIBE" => {
            handle_subscribe(state, client_id, writer, args, false).await;
        }
        b"UNSUBSCRIBE" => {
            handle_unsubscribe(state, client_id, writer, args, true).await;
        }
        b"PUNSUBSCRIBE" => {
            handle_unsubscribe(state, client_id, writer, args, false).await;
        }
        b"PUBLISH" => {
            let reply = if args.len() == 2 {
                let receivers = publish(state, &args[0], &args[1]).await;
                RespValue::Integer(receivers)
            } else {
                RespValue::Error("ERR wrong number of arguments".to_string())
            };
            let _ = write_frame(writer, &reply).await;
        }
        b"QUIT" => {
            let _ = write_frame(writer, &RespValue::SimpleString("OK".to_string())).await;
            return false;
        }
        _ => {
            let _ = write_frame(
                writer,
                &RespValue::Error("ERR unknown command".to_string()),
            )
            .await;
        }
    }

    true
}

async fn handle_subscribe(
    state: &Arc<Mutex<ServerState>>,
    client_id: u64,
    writer: &SharedWriter,
    names: &[Vec<u8>],
    channel_kind: bool,
) {
    let confirmation = if channel_kind { "subscribe" } else { "psubscribe" };

    for name in names {
        let count = {
            let mut guard = state.lock().await;

            let map = if channel_kind {
                &mut guard.channels
            } else {
                &mut guard.patterns
            };
            map.entry(name.clone())
                .or_default()
                .insert(client_id, Arc::clone(writer));

            let subs = guard.subscriptions.entry(client_id).or_default();
            if channel_kind {
                subs.channels.insert(name.clone());
            } else {
                subs.patterns.insert(name.clone());
            }

            (subs.channels.len() + subs.patterns.len()) as i64
        };

        let push = RespValue::Array(Some(vec![
            RespValue::BulkString(Some(confirmation.as_bytes().to_vec())),
            RespValue::BulkString(Some(name.clone())),
            RespValue::Integer(count),
        ]));
        let _ = write_frame(writer, &push).await;
    }
}

async fn handle_unsubscribe(
    state: &Arc<Mutex<ServerState>>,
    client_id: u64,
    writer: &SharedWriter,
    names: &[Vec<u8>],
    channel_kind: bool,
) {
    let confirmation = if channel_kind {
        "unsubscribe"
    } else {
        "punsubscribe"
    };

    let targets: Vec<Vec<u8>> = if names.is_empty() {
        let guard = state.lock().await;
        match guard.subscriptions.get(&client_id) {
            Some(subs) if channel_kind => subs.channels.iter().cloned().collect(),
            Some(subs) => subs.patterns.iter().cloned().collect(),
            None => Vec::new(),
        }
    } else {
        names.to_vec()
    };

    if targets.is_empty() {
        // Redis confirms an empty unsubscribe with a null name.
        let count = {
            let guard = state.lock().await;
            guard
                .subscriptions
                .get(&client_id)
                .map(|subs| (subs.channels.len() + subs.patterns.len()) as i64)
                .unwrap_or(0)
        };
        let push = RespValue::Array(Some(vec![
            RespValue::BulkString(Some(confirmation.as_bytes().to_vec())),
            RespValue::BulkString(None),
            RespValue::Integer(count),
        ]));
        let _ = write_frame(writer, &push).await;
        return;
    }

    for name in targets {
        let count = {
            let mut guard = state.lock().await;

            let map = if channel_kind {
                &mut guard.channels
            } else {
                &mut guard.patterns
            };
            if let Some(subscribers) = map.get_mut(&name) {
                subscribers.remove(&client_id);
                if subscribers.is_empty() {
                    map.remove(&name);
                }
            }

            let subs = guard.subscriptions.entry(client_id).or_default();
            if channel_kind {
                subs.channels.remove(&name);
            } else {
                subs.patterns.remove(&name);
            }

            (subs.channels.len() + subs.patterns.len()) as i64
        };

        let push = RespValue::Array(Some(vec![
            RespValue::BulkString(Some(confirmation.as_bytes().to_vec())),
            RespValue::BulkString(Some(name)),
            RespValue::Integer(count),
        ]));
        let _ = write_frame(writer, &push).await;
    }
}

async fn publish(state: &Arc<Mutex<ServerState>>, channel: &[u8], payload: &[u8]) -> i64 {
    let guard = state.lock().await;
    let mut receivers = 0;

    if let Some(subscribers) = guard.channels.get(channel) {
        let push = RespValue::Array(Some(vec![
            RespValue::BulkString(Some(b"message".to_vec())),
            RespValue::BulkString(Some(channel.to_vec())),
            RespValue::BulkString(Some(payload.to_vec())),
        ]));

        for subscriber in subscribers.values() {
            if write_frame(subscriber, &push).await.is_ok() {
                receivers += 1;
            }
        }
    }

    for (pattern, subscribers) in &guard.patterns {
        if !pattern_matches(pattern, channel) {
            continue;
        }

        let push = RespValue::Array(Some(vec![
            RespValue::BulkString(Some(b"pmessage".to_vec())),
            RespValue::BulkString(Some(pattern.clone())),
            RespValue::BulkString(Some(channel.to_vec())),
            RespValue::BulkString(Some(payload.to_vec())),
        ]));

        for subscriber in subscribers.values() {
            if write_frame(subscriber, &push).await.is_ok() {
                receivers += 1;
            }
        }
    }

    receivers
}

async fn cleanup_client(state: &Arc<Mutex<ServerState>>, client_id: u64) {
    let mut guard = state.lock().await;

    for subscribers in guard.channels.values_mut() {
        subscribers.remove(&client_id);
    }
    guard.channels.retain(|_, subscribers| !subscribers.is_empty());

    for subscribers in guard.patterns.values_mut() {
        subscribers.remove(&client_id);
    }
    guard.patterns.retain(|_, subscribers| !subscribers.is_empty());

    guard.subscriptions.remove(&client_id);
}

fn pattern_matches(pattern: &[u8], channel: &[u8]) -> bool {
    let pattern = String::from_utf8_lossy(pattern);
    let channel = String::from_utf8_lossy(channel);

    match Glob::new(&pattern) {
        Ok(glob) => glob.compile_matcher().is_match(channel.as_ref()),
        Err(_) => false,
    }
}

fn command_parts(frame: RespValue) -> Option<Vec<Vec<u8>>> {
    let RespValue::Array(Some(items)) = frame else {
        return None;
    };

    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RespValue::BulkString(Some(data)) => parts.push(data),
            _ => return None,
        }
    }

    if parts.is_empty() {
        return None;
    }

    Some(parts)
}

async fn write_frame(
    writer: &SharedWriter,
    frame: &RespValue,
) -> Result<(), std::io::Error> {
    let mut guard = writer.write().await;
    guard.write_all(&frame.encode()).await?;
    guard.flush().await?;

    Ok(())
}
