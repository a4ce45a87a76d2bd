//! In-memory server for integration tests
//!
//! `MockProvider` hands out `tokio::io::duplex` channels whose far end runs a
//! scripted server speaking the wire protocol. No sockets are involved, so tests can
//! run with a paused clock.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use wirepool::connection::{BoxChannel, ConnectionConfigBuilder, TlsConfig, TransportProvider};
use wirepool::{ConnectionConfig, Error, Result};

/// How the server answers one query
#[derive(Debug, Clone)]
pub enum Reply {
    /// `[{"sql": ..., "values": [...]}]`
    Echo,
    /// Rows as given (must be a JSON array of objects)
    Rows(Value),
    /// Error response for the query
    Error(&'static str),
    /// Error response with the session query id
    SessionError(&'static str),
    /// Never answer
    Silent,
    /// Rows payload that is not JSON
    Garbage,
    /// Drop the channel
    Hangup,
    /// Wait, then answer
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn delayed(delay: Duration, reply: Reply) -> Self {
        Reply::Delayed(delay, Box::new(reply))
    }
}

/// Server behaviour shared by every channel a provider opens
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Require this cleartext password
    pub password: Option<String>,
    /// Reject the startup with this message
    pub reject_startup: Option<&'static str>,
    /// Pause before answering the startup
    pub handshake_delay: Option<Duration>,
    /// Replies keyed by exact SQL; anything else is echoed
    pub replies: HashMap<String, Reply>,
}

impl Script {
    pub fn reply(mut self, sql: &str, reply: Reply) -> Self {
        self.replies.insert(sql.to_string(), reply);
        self
    }
}

/// What the server saw
#[derive(Debug, Default)]
pub struct Log {
    pub opens: AtomicUsize,
    pub secure_opens: AtomicUsize,
    pub terminates: AtomicUsize,
    pub startups: Mutex<Vec<Vec<(String, String)>>>,
    pub queries: Mutex<Vec<(String, Vec<Value>)>>,
}

impl Log {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn sql(&self) -> Vec<String> {
        self.queries.lock().iter().map(|(sql, _)| sql.clone()).collect()
    }
}

/// Transport provider backed by the scripted server
#[derive(Debug, Clone)]
pub struct MockProvider {
    script: Arc<Script>,
    pub log: Arc<Log>,
    refuse: Arc<AtomicBool>,
}

impl MockProvider {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            log: Arc::new(Log::default()),
            refuse: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fail every later channel open
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn shared(&self) -> Arc<dyn TransportProvider> {
        Arc::new(self.clone())
    }

    fn open(&self) -> Result<BoxChannel> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.log.opens.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let script = self.script.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let mut server = server;
            let _ = session(&mut server, &script, &log).await;
        });
        Ok(Box::new(client))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new(Script::default())
    }
}

impl TransportProvider for MockProvider {
    fn open_channel<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, Result<BoxChannel>> {
        Box::pin(async move { self.open() })
    }

    fn open_secure_channel<'a>(
        &'a self,
        _host: &'a str,
        _port: u16,
        _tls: &'a TlsConfig,
    ) -> BoxFuture<'a, Result<BoxChannel>> {
        Box::pin(async move {
            let channel = self.open()?;
            self.log.secure_opens.fetch_add(1, Ordering::SeqCst);
            Ok(channel)
        })
    }
}

/// Builder pointing at the mock server
pub fn config() -> ConnectionConfigBuilder {
    ConnectionConfig::builder("mock.internal", "orders", "app")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn session(io: &mut DuplexStream, script: &Script, log: &Log) -> io::Result<()> {
    // Startup has no tag byte
    let len = io.read_i32().await? as usize;
    let mut body = vec![0; len - 4];
    io.read_exact(&mut body).await?;
    log.startups.lock().push(parse_pairs(&body[4..]));

    if let Some(delay) = script.handshake_delay {
        tokio::time::sleep(delay).await;
    }

    if let Some(message) = script.reject_startup {
        write_error(io, 0, "28000", message).await?;
        return Ok(());
    }

    if let Some(expected) = &script.password {
        write_frame(io, b'R', &3i32.to_be_bytes()).await?;
        let (tag, body) = read_frame(io).await?;
        if tag != b'p' || cstr(&body) != *expected {
            write_error(io, 0, "28P01", "password authentication failed").await?;
            return Ok(());
        }
    }

    write_frame(io, b'R', &0i32.to_be_bytes()).await?;
    write_frame(io, b'S', b"server_version\0mock\0").await?;
    write_frame(io, b'Z', b"I").await?;

    loop {
        let (tag, body) = match read_frame(io).await {
            Ok(frame) => frame,
            Err(_) => return Ok(()),
        };

        match tag {
            b'X' => {
                log.terminates.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            b'Q' => {
                let id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let sql = cstr(&body[4..]);
                let values: Vec<Value> =
                    serde_json::from_slice(&body[4 + sql.len() + 1..]).unwrap_or_default();
                log.queries.lock().push((sql.clone(), values.clone()));

                let mut reply = script.replies.get(&sql).cloned().unwrap_or(Reply::Echo);
                let reply = loop {
                    match reply {
                        Reply::Delayed(delay, inner) => {
                            tokio::time::sleep(delay).await;
                            reply = *inner;
                        }
                        other => break other,
                    }
                };

                match reply {
                    Reply::Echo => {
                        let rows = json!([{ "sql": sql, "values": values }]);
                        write_rows(io, id, &serde_json::to_vec(&rows)?).await?;
                    }
                    Reply::Rows(rows) => write_rows(io, id, &serde_json::to_vec(&rows)?).await?,
                    Reply::Error(message) => write_error(io, id, "42000", message).await?,
                    Reply::SessionError(message) => write_error(io, 0, "57P01", message).await?,
                    Reply::Garbage => write_rows(io, id, b"{not json").await?,
                    Reply::Silent => {}
                    Reply::Hangup => return Ok(()),
                    Reply::Delayed(..) => unreachable!(),
                }
            }
            _ => return Ok(()),
        }
    }
}

async fn read_frame(io: &mut DuplexStream) -> io::Result<(u8, Vec<u8>)> {
    let tag = io.read_u8().await?;
    let len = io.read_i32().await? as usize;
    let mut body = vec![0; len - 4];
    io.read_exact(&mut body).await?;
    Ok((tag, body))
}

async fn write_frame(io: &mut DuplexStream, tag: u8, body: &[u8]) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    io.write_all(&buf).await?;
    io.flush().await
}

async fn write_rows(io: &mut DuplexStream, id: u32, payload: &[u8]) -> io::Result<()> {
    let mut body = id.to_be_bytes().to_vec();
    body.extend_from_slice(payload);
    write_frame(io, b'D', &body).await
}

async fn write_error(io: &mut DuplexStream, id: u32, code: &str, message: &str) -> io::Result<()> {
    let mut body = id.to_be_bytes().to_vec();
    body.extend_from_slice(code.as_bytes());
    body.push(0);
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    write_frame(io, b'E', &body).await
}

fn cstr(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn parse_pairs(mut data: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    while data.first().is_some_and(|&b| b != 0) {
        let key = cstr(data);
        data = &data[key.len() + 1..];
        let value = cstr(data);
        data = &data[value.len() + 1..];
        pairs.push((key, value));
    }
    pairs
}
