//! HubNode — TCP server exposing a [`Hub`] to remote clients.
//!
//! Each accepted connection gets a writer task fed by an unbounded queue.
//! Requests are dispatched on their own tasks so a blocked `call_and_wait`
//! never stalls the connection. Clients registered over a connection are
//! unregistered when it closes.

use crate::message::*;
use samphub_kernel::Hub;
use samphub_types::error::HubError;
use samphub_types::ids::PrivateKey;
use samphub_types::proxy::{parse_timeout, HubProxy};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
}

impl From<WireError> for HubError {
    fn from(err: WireError) -> Self {
        HubError::Transport(err.to_string())
    }
}

/// Frame size limit used when none is configured (16 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

type Outbox = mpsc::UnboundedSender<WireMessage>;

/// The hub's TCP listener.
pub struct HubNode {
    hub: Arc<Hub>,
    local_addr: SocketAddr,
    max_message_size: u32,
}

impl HubNode {
    /// Bind `addr` and start accepting connections. The accept loop ends
    /// when the hub shuts down.
    pub async fn start(
        addr: SocketAddr,
        hub: Arc<Hub>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let max_message_size = hub.config().max_message_size;
        info!(addr = %local_addr, hub = %hub.config().hub_name, "Hub listening");

        let node = Arc::new(Self {
            hub,
            local_addr,
            max_message_size,
        });
        let accept = tokio::spawn(Self::accept_loop(listener, Arc::clone(&node)));
        Ok((node, accept))
    }

    /// Start on the hub's configured `listen_addr`.
    pub async fn bind(hub: Arc<Hub>) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        let configured = hub.config().listen_addr.clone();
        let addr: SocketAddr = configured
            .parse()
            .map_err(|_| WireError::InvalidAddress(configured))?;
        Self::start(addr, hub).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    async fn accept_loop(listener: TcpListener, node: Arc<HubNode>) {
        let mut shutdown = node.hub.subscribe_shutdown();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "Accepted connection");
                        let node = Arc::clone(&node);
                        tokio::spawn(async move {
                            if let Err(e) = node.serve_connection(stream, addr).await {
                                debug!(peer = %addr, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(addr = %node.local_addr, "Hub listener stopped");
    }

    async fn serve_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), WireError> {
        let (mut reader, mut writer) = stream.into_split();
        let (outbox, mut queue) = mpsc::unbounded_channel::<WireMessage>();

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = queue.recv().await {
                if let Err(e) = write_message(&mut writer, &msg).await {
                    debug!(peer = %addr, error = %e, "Write failed, closing connection");
                    break;
                }
            }
        });

        let owned_keys: Arc<Mutex<Vec<PrivateKey>>> = Arc::new(Mutex::new(Vec::new()));
        let result = loop {
            let msg = match read_message(&mut reader, self.max_message_size).await {
                Ok(msg) => msg,
                Err(WireError::ConnectionClosed) => break Ok(()),
                Err(e) => break Err(e),
            };
            match msg.kind {
                WireMessageKind::Request(request) => {
                    let hub = Arc::clone(&self.hub);
                    let outbox = outbox.clone();
                    let owned_keys = Arc::clone(&owned_keys);
                    let id = msg.id;
                    tokio::spawn(async move {
                        let response = dispatch(&hub, request, &outbox, &owned_keys).await;
                        let _ = outbox.send(WireMessage {
                            id,
                            kind: WireMessageKind::Response(response),
                        });
                    });
                }
                WireMessageKind::Response(_) | WireMessageKind::Push(_) => {
                    warn!(peer = %addr, id = %msg.id, "Unexpected frame from client, ignored");
                }
            }
        };

        let keys = std::mem::take(&mut *owned_keys.lock().unwrap_or_else(|e| e.into_inner()));
        for key in keys {
            // Already gone if the client unregistered explicitly.
            let _ = self.hub.unregister(&key).await;
        }
        drop(outbox);
        writer_task.abort();
        debug!(peer = %addr, "Connection closed");
        result
    }
}

fn to_response<T: Serialize>(result: Result<T, HubError>) -> WireResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(result) => WireResponse::Ok { result },
            Err(e) => HubError::Protocol(format!("unencodable result: {e}")).into(),
        },
        Err(e) => e.into(),
    }
}

/// Execute one request against the hub.
async fn dispatch(
    hub: &Arc<Hub>,
    request: HubRequest,
    outbox: &Outbox,
    owned_keys: &Mutex<Vec<PrivateKey>>,
) -> WireResponse {
    debug!(method = request.method(), "Request");
    let proxy: &dyn HubProxy = hub.as_ref();
    match request {
        HubRequest::Register => {
            let (inbox, pushes) = mpsc::unbounded_channel();
            let result = proxy.register(inbox).await;
            if let Ok(registration) = &result {
                owned_keys
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(registration.private_key.clone());
                spawn_forwarder(registration.client_id.clone(), pushes, outbox.clone());
            }
            to_response(result)
        }
        HubRequest::Unregister { key } => {
            let result = proxy.unregister(&key).await;
            if result.is_ok() {
                owned_keys
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|k| k != &key);
            }
            to_response(result)
        }
        HubRequest::DeclareMetadata { key, metadata } => {
            to_response(proxy.declare_metadata(&key, metadata).await)
        }
        HubRequest::GetMetadata { key, client } => {
            to_response(proxy.get_metadata(&key, &client).await)
        }
        HubRequest::DeclareSubscriptions { key, subscriptions } => {
            to_response(proxy.declare_subscriptions(&key, subscriptions).await)
        }
        HubRequest::GetSubscriptions { key, client } => {
            to_response(proxy.get_subscriptions(&key, &client).await)
        }
        HubRequest::GetRegisteredClients { key } => {
            to_response(proxy.get_registered_clients(&key).await)
        }
        HubRequest::GetSubscribedClients { key, mtype } => {
            to_response(proxy.get_subscribed_clients(&key, &mtype).await)
        }
        HubRequest::Notify {
            key,
            recipient,
            message,
        } => to_response(proxy.notify(&key, &recipient, message).await),
        HubRequest::NotifyAll { key, message } => {
            to_response(proxy.notify_all(&key, message).await)
        }
        HubRequest::Call {
            key,
            recipient,
            tag,
            message,
        } => to_response(proxy.call(&key, &recipient, &tag, message).await),
        HubRequest::CallAll { key, tag, message } => {
            to_response(proxy.call_all(&key, &tag, message).await)
        }
        HubRequest::CallAndWait {
            key,
            recipient,
            message,
            timeout,
        } => match parse_timeout(&timeout) {
            Ok(timeout) => {
                to_response(proxy.call_and_wait(&key, &recipient, message, timeout).await)
            }
            Err(e) => e.into(),
        },
        HubRequest::Reply {
            key,
            msg_id,
            response,
        } => to_response(proxy.reply(&key, &msg_id, response).await),
        HubRequest::Ping => WireResponse::Ok {
            result: serde_json::json!({ "uptime_secs": hub.uptime_secs() }),
        },
    }
}

/// Relay a registered client's pushes onto its connection. Ends when the
/// hub drops the client or the connection closes.
fn spawn_forwarder(
    client: samphub_types::ids::ClientId,
    mut pushes: samphub_types::proxy::PushReceiver,
    outbox: Outbox,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                push = pushes.recv() => {
                    let Some(push) = push else { break };
                    let frame = WireMessage {
                        id: uuid::Uuid::new_v4().to_string(),
                        kind: WireMessageKind::Push(WirePush {
                            recipient: client.clone(),
                            push,
                        }),
                    };
                    if outbox.send(frame).is_err() {
                        break;
                    }
                }
                _ = outbox.closed() => break,
            }
        }
        debug!(client = %client, "Push forwarder stopped");
    });
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &WireMessage,
) -> Result<(), WireError> {
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message, rejecting bodies over `max_size` bytes.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: u32,
) -> Result<WireMessage, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max_size {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(decode_message(&body)?)
}
