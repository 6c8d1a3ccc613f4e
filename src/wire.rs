//! The submission wire protocol: newline-delimited JSON over localhost TCP.
//!
//! One request per connection. Clients send a [`Request`] line and read a
//! single [`Response`] line back. Decoding happens outside the engine lock;
//! the listener never blocks on the network while holding shared state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{Engine, EngineStatus};
use crate::error::{Result, SlotdError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Queue a job. `slots` defaults to 1 when omitted.
    Submit {
        argv: Vec<String>,
        #[serde(default)]
        priority: bool,
        #[serde(default)]
        slots: Option<u32>,
    },
    /// Ask for the pending/free counts.
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Submitted {
        job_id: Uuid,
        created_at_ms: i64,
    },
    Status {
        pending: usize,
        free_slots: usize,
        total_slots: u32,
        running: usize,
    },
    Error {
        message: String,
    },
}

/// Receipt a client gets back for a queued job.
#[derive(Debug, Clone, Copy)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub created_at_ms: i64,
}

/// Accepts client connections and feeds decoded submissions to the engine.
pub struct Listener {
    listener: TcpListener,
    engine: Arc<Engine>,
}

impl Listener {
    /// Bind on localhost. Port 0 asks the OS for an ephemeral port; use
    /// [`Listener::local_port`] to learn which one it picked.
    pub async fn bind(engine: Arc<Engine>, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(Self { listener, engine })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(port = self.local_port().ok(), "listener running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let engine = self.engine.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(engine, stream).await {
                                    tracing::warn!(%peer, error = %e, "connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
        tracing::info!("listener stopped");
    }
}

async fn handle_connection(engine: Arc<Engine>, stream: TcpStream) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => dispatch(&engine, request),
        Err(e) => Response::Error {
            message: format!("malformed request: {e}"),
        },
    };

    let mut encoded = serde_json::to_string(&response)?;
    encoded.push('\n');
    write.write_all(encoded.as_bytes()).await?;
    write.shutdown().await?;
    Ok(())
}

fn dispatch(engine: &Engine, request: Request) -> Response {
    match request {
        Request::Submit {
            argv,
            priority,
            slots,
        } => {
            let slots = slots.unwrap_or(1);
            if slots == 0 {
                return Response::Error {
                    message: "slots must be at least 1".to_string(),
                };
            }
            match engine.submit(argv, priority, slots) {
                Ok(ticket) => Response::Submitted {
                    job_id: ticket.id,
                    created_at_ms: ticket.created_at.timestamp_millis(),
                },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            }
        }
        Request::Status => {
            let status = engine.status();
            Response::Status {
                pending: status.pending,
                free_slots: status.free_slots,
                total_slots: status.total_slots,
                running: status.running,
            }
        }
    }
}

async fn roundtrip(port: u16, request: &Request) -> Result<Response> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (read, mut write) = stream.into_split();

    let mut encoded = serde_json::to_string(request)?;
    encoded.push('\n');
    write.write_all(encoded.as_bytes()).await?;
    write.shutdown().await?;

    let mut lines = BufReader::new(read).lines();
    let Some(line) = lines.next_line().await? else {
        return Err(SlotdError::Protocol(
            "server closed the connection without replying".to_string(),
        ));
    };
    Ok(serde_json::from_str(&line)?)
}

/// Client side of [`Request::Submit`].
pub async fn submit_job(
    port: u16,
    argv: Vec<String>,
    priority: bool,
    slots: u32,
) -> Result<SubmitReceipt> {
    let request = Request::Submit {
        argv,
        priority,
        slots: Some(slots),
    };
    match roundtrip(port, &request).await? {
        Response::Submitted {
            job_id,
            created_at_ms,
        } => Ok(SubmitReceipt {
            job_id,
            created_at_ms,
        }),
        Response::Error { message } => Err(SlotdError::Protocol(message)),
        Response::Status { .. } => Err(SlotdError::Protocol(
            "unexpected reply to submit".to_string(),
        )),
    }
}

/// Client side of [`Request::Status`].
pub async fn fetch_status(port: u16) -> Result<EngineStatus> {
    match roundtrip(port, &Request::Status).await? {
        Response::Status {
            pending,
            free_slots,
            total_slots,
            running,
        } => Ok(EngineStatus {
            pending,
            free_slots,
            total_slots,
            running,
        }),
        Response::Error { message } => Err(SlotdError::Protocol(message)),
        Response::Submitted { .. } => Err(SlotdError::Protocol(
            "unexpected reply to status".to_string(),
        )),
    }
}
