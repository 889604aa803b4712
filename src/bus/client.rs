use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BusError, BusResult};

use super::wire::{read_frame, write_frame, Frame};

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
    /// Keep the session alive across broker restarts by reconnecting and
    /// re-issuing subscriptions.
    pub reconnect: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            attempts: 3,
            backoff: Duration::from_secs(2),
            reconnect: true,
        }
    }
}

enum Command {
    Publish {
        subject: String,
        payload: Value,
    },
    Subscribe {
        subject: String,
        sink: mpsc::UnboundedSender<Value>,
        ready: oneshot::Sender<()>,
    },
    Drain {
        done: oneshot::Sender<()>,
    },
}

enum ReaderEvent {
    Frame(Frame),
    Closed(BusError),
}

/// Handle to a bus session. Cheap to clone; all clones share one TCP
/// connection driven by a background task.
#[derive(Clone)]
pub struct BusClient {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl BusClient {
    /// Connects with per-attempt timeout and fixed backoff between attempts.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectTimeout`] when every attempt fails.
    pub async fn connect(addr: &str, options: ConnectOptions) -> BusResult<Self> {
        let stream = connect_with_retries(addr, &options).await?;
        info!("Connected to bus at {}", addr);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(addr.to_owned(), options, stream, command_rx));

        Ok(Self { command_tx })
    }

    /// Publishes a JSON payload to `subject`. Fire-and-forget: delivery is
    /// not acknowledged, and frames queued while the connection is down are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not serialize or the session
    /// task is gone.
    pub fn publish<T>(&self, subject: &str, payload: &T) -> BusResult<()>
    where
        T: Serialize,
    {
        let payload = serde_json::to_value(payload).map_err(|source| BusError::Serialize {
            context: "encode publish payload",
            source,
        })?;
        self.command_tx
            .send(Command::Publish {
                subject: subject.to_owned(),
                payload,
            })
            .map_err(|_| BusError::ClientGone)
    }

    /// Subscribes to `subject`; resolves once the broker has been sent the
    /// subscription, so messages published afterwards are observed.
    ///
    /// # Errors
    ///
    /// Returns an error if the session task is gone.
    pub async fn subscribe(&self, subject: &str) -> BusResult<mpsc::UnboundedReceiver<Value>> {
        let (sink, receiver) = mpsc::unbounded_channel();
        let (ready, ready_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Subscribe {
                subject: subject.to_owned(),
                sink,
                ready,
            })
            .map_err(|_| BusError::ClientGone)?;
        ready_rx.await.map_err(|_| BusError::ClientGone)?;
        Ok(receiver)
    }

    /// Flushes pending writes and closes the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session task is already gone.
    pub async fn drain(&self) -> BusResult<()> {
        let (done, done_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Drain { done })
            .map_err(|_| BusError::ClientGone)?;
        done_rx.await.map_err(|_| BusError::ClientGone)
    }
}

async fn connect_with_retries(addr: &str, options: &ConnectOptions) -> BusResult<TcpStream> {
    let attempts = options.attempts.max(1);
    for attempt in 1..=attempts {
        match tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => {
                warn!("Bus connect attempt {}/{} failed: {}", attempt, attempts, err);
            }
            Err(_) => {
                warn!(
                    "Bus connect attempt {}/{} timed out after {:?}",
                    attempt, attempts, options.connect_timeout
                );
            }
        }
        if attempt < attempts {
            tokio::time::sleep(options.backoff).await;
        }
    }
    Err(BusError::ConnectTimeout {
        addr: addr.to_owned(),
        attempts,
    })
}

async fn drive(
    addr: String,
    options: ConnectOptions,
    mut stream: TcpStream,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut subscriptions: HashMap<String, Vec<mpsc::UnboundedSender<Value>>> = HashMap::new();

    'session: loop {
        let (read_half, mut write_half) = stream.into_split();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let reader_handle = spawn_reader(read_half, event_tx);

        // Replay subscriptions after (re)connect.
        let mut session_ok = true;
        for subject in subscriptions.keys() {
            let frame = Frame::Sub {
                subject: subject.clone(),
            };
            if write_frame(&mut write_half, &frame).await.is_err() {
                session_ok = false;
                break;
            }
        }

        while session_ok {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        // Every client handle is gone; flush and stop.
                        let _ = write_half.flush().await;
                        reader_handle.abort();
                        return;
                    };
                    match command {
                        Command::Publish { subject, payload } => {
                            let frame = Frame::Pub { subject, payload };
                            if write_frame(&mut write_half, &frame).await.is_err() {
                                session_ok = false;
                            }
                        }
                        Command::Subscribe { subject, sink, ready } => {
                            let frame = Frame::Sub { subject: subject.clone() };
                            if write_frame(&mut write_half, &frame).await.is_err() {
                                session_ok = false;
                            }
                            subscriptions.entry(subject).or_default().push(sink);
                            drop(ready.send(()));
                        }
                        Command::Drain { done } => {
                            let _ = write_half.flush().await;
                            reader_handle.abort();
                            drop(done.send(()));
                            return;
                        }
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(ReaderEvent::Frame(Frame::Msg { subject, payload })) => {
                            if let Some(sinks) = subscriptions.get_mut(&subject) {
                                sinks.retain(|sink| sink.send(payload.clone()).is_ok());
                            }
                        }
                        Some(ReaderEvent::Frame(_)) => {}
                        Some(ReaderEvent::Closed(err)) => {
                            debug!("Bus connection lost: {}", err);
                            session_ok = false;
                        }
                        None => {
                            session_ok = false;
                        }
                    }
                }
            }
        }

        reader_handle.abort();

        if !options.reconnect {
            return;
        }

        warn!("Bus connection to {} lost, reconnecting", addr);
        stream = loop {
            tokio::time::sleep(options.backoff).await;
            match tokio::time::timeout(options.connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(err)) => debug!("Bus reconnect failed: {}", err),
                Err(_) => debug!("Bus reconnect timed out"),
            }
            // Publishers may have given up while we were away.
            if command_rx.is_closed() {
                return;
            }
        };
        info!("Reconnected to bus at {}", addr);
        continue 'session;
    }
}

fn spawn_reader(
    read_half: tokio::net::tcp::OwnedReadHalf,
    event_tx: mpsc::UnboundedSender<ReaderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if event_tx.send(ReaderEvent::Frame(frame)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    drop(event_tx.send(ReaderEvent::Closed(err)));
                    break;
                }
            }
        }
    })
}
