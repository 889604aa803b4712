use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};

use super::wire::{read_frame, write_frame, Frame};

type SubscriberMap = HashMap<String, HashMap<u64, mpsc::UnboundedSender<Frame>>>;

/// In-process broker: subject -> connected subscribers, exact-match fan-out.
pub struct BusServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

impl BusServer {
    /// Binds and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn start(addr: &str) -> BusResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| BusError::Bind {
            addr: addr.to_owned(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| BusError::Io {
            context: "resolve listener address",
            source,
        })?;

        let subscribers: Arc<Mutex<SubscriberMap>> = Arc::new(Mutex::new(HashMap::new()));
        let next_conn_id = Arc::new(AtomicU64::new(1));

        let accept_handle = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Bus accept failed: {}", err);
                        continue;
                    }
                };
                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                debug!("Bus connection {} from {}", conn_id, peer);
                tokio::spawn(handle_connection(socket, conn_id, subscribers.clone()));
            }
        });

        Ok(Self {
            local_addr,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Probes the listener until it accepts a connection or `timeout`
    /// elapses.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotReady`] when the deadline passes first.
    pub async fn wait_ready(&self, timeout: Duration) -> BusResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match TcpStream::connect(self.local_addr).await {
                Ok(_) => return Ok(()),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(_) => {
                    return Err(BusError::NotReady {
                        timeout_secs: timeout.as_secs(),
                    })
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.accept_handle.abort();
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

async fn handle_connection(
    socket: TcpStream,
    conn_id: u64,
    subscribers: Arc<Mutex<SubscriberMap>>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    // Subjects this connection subscribed to, for cleanup on disconnect.
    let mut owned_subjects: Vec<String> = Vec::new();
    let mut reader = BufReader::new(read_half);

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(BusError::ConnectionClosed) => break,
            Err(err) => {
                debug!("Bus connection {} dropped: {}", conn_id, err);
                break;
            }
        };

        match frame {
            Frame::Sub { subject } => {
                let mut map = subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                map.entry(subject.clone())
                    .or_default()
                    .insert(conn_id, out_tx.clone());
                drop(map);
                if !owned_subjects.contains(&subject) {
                    owned_subjects.push(subject);
                }
            }
            Frame::Unsub { subject } => {
                let mut map = subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(entries) = map.get_mut(&subject) {
                    entries.remove(&conn_id);
                    if entries.is_empty() {
                        map.remove(&subject);
                    }
                }
                drop(map);
                owned_subjects.retain(|owned| owned != &subject);
            }
            Frame::Pub { subject, payload } => {
                dispatch(&subscribers, &subject, payload);
            }
            Frame::Ping => {
                if out_tx.send(Frame::Pong).is_err() {
                    break;
                }
            }
            Frame::Pong | Frame::Msg { .. } => {
                // Clients do not originate these; ignore.
            }
        }
    }

    {
        let mut map = subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for subject in owned_subjects {
            if let Some(entries) = map.get_mut(&subject) {
                entries.remove(&conn_id);
                if entries.is_empty() {
                    map.remove(&subject);
                }
            }
        }
    }

    drop(out_tx);
    if writer_handle.await.is_err() {
        // Writer aborted with the connection; nothing to clean up.
    }
    debug!("Bus connection {} closed", conn_id);
}

fn dispatch(subscribers: &Mutex<SubscriberMap>, subject: &str, payload: serde_json::Value) {
    let mut map = subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let Some(entries) = map.get_mut(subject) else {
        return;
    };
    entries.retain(|_, sender| {
        sender
            .send(Frame::Msg {
                subject: subject.to_owned(),
                payload: payload.clone(),
            })
            .is_ok()
    });
    if entries.is_empty() {
        map.remove(subject);
    }
}
