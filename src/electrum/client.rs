//! Async Electrum client behind the blocking [`ElectrumConnection`] facade.
//!
//! A background thread owns a tokio runtime, the socket and the JSON-RPC
//! correlation state; the driver thread only touches the shared queues. The
//! task reconnects on its own after a dropped or killed connection, emitting
//! `Disconnected` / `ServerReady` around each attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsConnector;

use crate::electrum::api::ElectrumConnection;
use crate::electrum::types::{parse_notification, parse_response};
use crate::engine::types::{ElectrumRequest, EngineEvent};

const CLIENT_NAME: &str = "electrum-spv-wallet";
const PROTOCOL_VERSION: &str = "1.4";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const READ_POLL: Duration = Duration::from_millis(50);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

#[derive(Default)]
struct SharedState {
    outgoing: VecDeque<ElectrumRequest>,
    events: VecDeque<EngineEvent>,
    /// id -> original request, for response correlation
    inflight: HashMap<u64, ElectrumRequest>,
    disconnect_requested: bool,
}

pub struct ElectrumClient {
    state: Arc<Mutex<SharedState>>,
}

impl ElectrumClient {
    /// `server` is `ssl://host:port` or `tcp://host:port` (`ssl` assumed when
    /// no scheme is given).
    pub fn new(server: String) -> Self {
        let state = Arc::new(Mutex::new(SharedState::default()));
        let task_state = state.clone();

        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(err) => {
                    log::error!("[ELECTRUM] no runtime: {}", err);
                    return;
                }
            };
            runtime.block_on(async move {
                loop {
                    match ElectrumTask::connect(&server, task_state.clone()).await {
                        Ok(mut task) => {
                            if let Err(err) = task.run().await {
                                log::warn!("[ELECTRUM] connection lost: {}", err);
                            }
                        }
                        Err(err) => {
                            log::warn!("[ELECTRUM] connect failed: {}", err);
                        }
                    }
                    {
                        let mut shared = task_state.lock().unwrap();
                        shared.inflight.clear();
                        shared.disconnect_requested = false;
                        shared.events.push_back(EngineEvent::Disconnected);
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            });
        });

        Self { state }
    }
}

impl ElectrumConnection for ElectrumClient {
    fn send(&mut self, request: ElectrumRequest) {
        self.state.lock().unwrap().outgoing.push_back(request);
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.state.lock().unwrap().events.pop_front()
    }

    fn disconnect(&mut self) {
        self.state.lock().unwrap().disconnect_requested = true;
    }
}

// =====================================================================
// Background task
// =====================================================================

struct ElectrumTask {
    reader: BufReader<ReadHalf<Box<dyn IoStream>>>,
    writer: WriteHalf<Box<dyn IoStream>>,
    state: Arc<Mutex<SharedState>>,
}

impl ElectrumTask {
    async fn connect(server: &str, state: Arc<Mutex<SharedState>>) -> Result<Self> {
        let (ssl, host, port) = parse_server(server)?;
        log::info!("[ELECTRUM] connecting to {}:{} (ssl={})", host, port, ssl);

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        let stream: Box<dyn IoStream> = if ssl {
            let connector = TlsConnector::from(native_tls::TlsConnector::new()?);
            Box::new(connector.connect(&host, tcp).await?)
        } else {
            Box::new(tcp)
        };
        let (reader, writer) = tokio::io::split(stream);

        let mut task = Self {
            reader: BufReader::new(reader),
            writer,
            state,
        };
        task.handshake().await?;
        Ok(task)
    }

    async fn handshake(&mut self) -> Result<()> {
        let hello = serde_json::json!({
            "jsonrpc": "2.0",
            "id": next_id(),
            "method": "server.version",
            "params": [CLIENT_NAME, PROTOCOL_VERSION],
        });
        self.write_json(&hello).await?;
        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        log::info!("[ELECTRUM] handshake ok: {}", line.trim());
        self.state
            .lock()
            .unwrap()
            .events
            .push_back(EngineEvent::ServerReady);
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let mut line = String::new();
        loop {
            if self.state.lock().unwrap().disconnect_requested {
                bail!("disconnect requested");
            }
            self.flush_outgoing().await?;

            line.clear();
            match timeout(READ_POLL, self.reader.read_line(&mut line)).await {
                Err(_) => continue, // nothing to read, go flush again
                Ok(Ok(0)) => bail!("server closed the connection"),
                Ok(Ok(_)) => self.handle_line(line.trim()),
                Ok(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn flush_outgoing(&mut self) -> Result<()> {
        loop {
            let (id, request) = {
                let mut shared = self.state.lock().unwrap();
                let Some(request) = shared.outgoing.pop_front() else {
                    return Ok(());
                };
                let id = next_id();
                shared.inflight.insert(id, request.clone());
                (id, request)
            };
            log::trace!("[ELECTRUM] >>> {:?}", request);
            self.write_json(&request.to_json(id)).await?;
        }
    }

    fn handle_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        log::trace!("[ELECTRUM] <<< {}", line);
        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("[ELECTRUM] unparseable message: {}", err);
                return;
            }
        };

        let event = if let Some(id) = message.get("id").and_then(Value::as_u64) {
            let Some(request) = self.state.lock().unwrap().inflight.remove(&id) else {
                log::warn!("[ELECTRUM] response for unknown id {}", id);
                return;
            };
            if let Some(error) = message.get("error") {
                Ok(Some(EngineEvent::ServerError {
                    request,
                    message: error.to_string(),
                }))
            } else {
                parse_response(&request, message.get("result").unwrap_or(&Value::Null))
            }
        } else if let Some(method) = message.get("method").and_then(Value::as_str) {
            parse_notification(method, message.get("params").unwrap_or(&Value::Null))
        } else {
            Err(anyhow!("message is neither response nor notification"))
        };

        match event {
            Ok(Some(event)) => self.state.lock().unwrap().events.push_back(event),
            Ok(None) => {}
            Err(err) => log::warn!("[ELECTRUM] dropping malformed payload: {}", err),
        }
    }

    async fn write_json(&mut self, value: &Value) -> Result<()> {
        let mut payload = serde_json::to_string(value)?;
        payload.push('\n');
        self.writer.write_all(payload.as_bytes()).await?;
        Ok(())
    }
}

fn parse_server(server: &str) -> Result<(bool, String, u16)> {
    let server = server.trim();
    let (ssl, rest) = if let Some(rest) = server.strip_prefix("ssl://") {
        (true, rest)
    } else if let Some(rest) = server.strip_prefix("tcp://") {
        (false, rest)
    } else {
        (true, server)
    };
    let (host, port) = rest
        .split_once(':')
        .ok_or_else(|| anyhow!("server must be host:port"))?;
    Ok((
        ssl,
        host.to_string(),
        port.parse().context("invalid port")?,
    ))
}
