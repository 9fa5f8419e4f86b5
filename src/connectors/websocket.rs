use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::connector::{Connector, ConnectorState, Destination, Message, MessageStream, Source};
use crate::error::{ConnectionError, WriteError};
use crate::pipeline::retry::Backoff;
use crate::util;

/// Option key enabling periodic transport swaps (integer nanoseconds).
pub const RECONNECT_EVERY: &str = "reconnect_every";

/// Used when `reconnect_every` is present but not an integer.
const DEFAULT_RECONNECT_EVERY: Duration = Duration::from_secs(60);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames held for a reader that has not called `read()` yet.
const PENDING_LIMIT: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Frame>;
type WsReader = SplitStream<WsStream>;

/// ============================================================
/// WebSocket
/// ============================================================
///
/// Source and Destination over a single WebSocket connection.
///
/// Responsibilities:
/// - Read text frames and forward them to the pipeline
/// - Write pipeline messages as text frames
/// - Swap the transport every `reconnect_every` (if configured)
/// - Replace the transport as soon as a read fails
///
/// SWAP PROTOCOL:
/// - Every replacement happens inside one exclusive section, whichever
///   trigger (timer or read failure) started it
/// - The read loop is parked before the new transport is dialed, so no
///   read is ever issued against a transport being replaced
/// - The new transport is installed before the old one is closed
///
/// READ LOOP:
/// - Runs from `connect()` to `disconnect()`, also when the connector is
///   only used as a Destination, so pings, close frames and dead peers are
///   noticed without a reader
/// - Frames that arrive before `read()` are held (up to `PENDING_LIMIT`)
///   and handed to the first reader
///
/// LIMITATIONS:
/// - Frames in flight on the old transport when it is closed are lost
///
pub struct WebSocket {
    shared: Arc<Shared>,
    reconnect_every: Option<Duration>,

    /// Present between `connect()` and `disconnect()`.
    session: Mutex<Option<Session>>,
}

/// Background tasks of one connect/disconnect cycle.
struct Session {
    terminate: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,

    /// Hands the message stream to the read loop; taken by `read()`.
    attach: Option<oneshot::Sender<mpsc::UnboundedSender<Message>>>,
}

/// State reachable from the background tasks.
struct Shared {
    url: String,
    headers: Vec<(String, String)>,

    /// Write half of the current transport.
    writer: Mutex<Option<WsWriter>>,

    /// The exclusive section guarding transport replacement.
    section: Mutex<Section>,

    state: AtomicU8,
    reconnects: AtomicU64,
    swaps: AtomicU64,
}

/// Data only touched while replacing the transport.
#[derive(Default)]
struct Section {
    /// Swap handle of the running read loop.
    read_loop: Option<mpsc::Sender<SwapTicket>>,
}

/// Rendezvous between a swapping task and the read loop.
///
/// The read loop answers `parked` once it has stopped reading, then waits
/// on `resume` for the replacement read half. A dropped `resume` sender
/// means the swap failed and the old read half stays in use.
struct SwapTicket {
    parked: oneshot::Sender<()>,
    resume: oneshot::Receiver<WsReader>,
}

impl SwapTicket {
    async fn park(self) -> Option<WsReader> {
        let _ = self.parked.send(());
        self.resume.await.ok()
    }
}

impl WebSocket {
    pub fn new(
        url: impl Into<String>,
        headers: Vec<(String, String)>,
        reconnect_every: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                headers,
                writer: Mutex::new(None),
                section: Mutex::new(Section::default()),
                state: AtomicU8::new(state_to_u8(ConnectorState::Disconnected)),
                reconnects: AtomicU64::new(0),
                swaps: AtomicU64::new(0),
            }),
            reconnect_every,
            session: Mutex::new(None),
        }
    }

    /// Builds a connector from the string-keyed option map.
    ///
    /// An unparsable `reconnect_every` is logged and replaced by the
    /// one minute default.
    pub fn from_options(
        url: impl Into<String>,
        headers: &HashMap<String, String>,
        args: &HashMap<String, String>,
    ) -> Self {
        let reconnect_every = match util::option_nanos(args, RECONNECT_EVERY) {
            Ok(every) => every,
            Err(raw) => {
                error!(
                    "{} is not an integer, using {:?}",
                    raw, DEFAULT_RECONNECT_EVERY
                );
                Some(DEFAULT_RECONNECT_EVERY)
            }
        };

        let headers = headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self::new(url, headers, reconnect_every)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn reconnect_every(&self) -> Option<Duration> {
        self.reconnect_every
    }

    pub fn state(&self) -> ConnectorState {
        self.shared.state()
    }

    /// Replacements triggered by a failed read.
    pub fn reconnects(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    /// Replacements triggered by the reconnect timer.
    pub fn swaps(&self) -> u64 {
        self.shared.swaps.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Connector for WebSocket {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            warn!("websocket: connect() called while connected, ignoring");
            return Ok(());
        }

        let (writer, reader) = self.shared.dial().await?;
        let (swap_tx, swap_rx) = mpsc::channel(1);
        {
            let mut section = self.shared.section.lock().await;
            *self.shared.writer.lock().await = Some(writer);
            section.read_loop = Some(swap_tx);
        }

        let (terminate, _) = watch::channel(false);
        let (attach_tx, attach_rx) = oneshot::channel();
        let mut tasks = vec![tokio::spawn(read_loop(
            self.shared.clone(),
            reader,
            swap_rx,
            terminate.subscribe(),
            attach_rx,
        ))];

        if let Some(every) = self.reconnect_every {
            info!("got `{}`, launching reconnect loop", RECONNECT_EVERY);
            tasks.push(tokio::spawn(reconnect_loop(
                self.shared.clone(),
                every,
                terminate.subscribe(),
            )));
        }

        self.shared.set_state(ConnectorState::Connected);
        *session = Some(Session {
            terminate,
            tasks,
            attach: Some(attach_tx),
        });
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            return Ok(());
        };

        info!("websocket: disconnect started");
        session.terminate.send_replace(true);

        // waits for an in-flight swap to finish
        {
            let mut section = self.shared.section.lock().await;
            section.read_loop = None;
        }

        let writer = self.shared.writer.lock().await.take();
        if let Some(writer) = writer {
            close_writer(writer).await;
        }

        info!("waiting for websocket tasks to finish...");
        let mut failure = None;
        for task in session.tasks {
            if let Err(e) = task.await {
                failure = Some(e);
            }
        }
        self.shared.set_state(ConnectorState::Disconnected);
        info!("websocket tasks finished");

        match failure {
            Some(e) => Err(anyhow::anyhow!("websocket task failed: {}", e)),
            None => Ok(()),
        }
    }

    fn info(&self) {
        info!("URL: {}", self.shared.url);
        if !self.shared.headers.is_empty() {
            info!("headers: {}", self.shared.headers.len());
        }
        match self.reconnect_every {
            Some(every) => info!("reconnect every: {:?}", every),
            None => info!("periodic reconnect disabled"),
        }
    }
}

#[async_trait::async_trait]
impl Source for WebSocket {
    async fn read(&self) -> Result<MessageStream, ConnectionError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        let attach = session
            .attach
            .take()
            .ok_or(ConnectionError::AlreadyReading)?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        attach
            .send(out_tx)
            .map_err(|_| ConnectionError::NotConnected)?;

        Ok(out_rx)
    }
}

#[async_trait::async_trait]
impl Destination for WebSocket {
    async fn write(&self, message: Message) -> Result<(), WriteError> {
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(WriteError::NotConnected)?;
        writer.send(Frame::text(message)).await?;
        Ok(())
    }
}

impl Shared {
    fn state(&self) -> ConnectorState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectorState) {
        self.state.store(state_to_u8(state), Ordering::Release);
    }

    fn request(&self) -> Result<Request, ConnectionError> {
        let mut request = self.url.as_str().into_client_request().map_err(|source| {
            ConnectionError::InvalidUrl {
                url: self.url.clone(),
                source,
            }
        })?;

        for (name, value) in &self.headers {
            let invalid = |reason: String| ConnectionError::InvalidHeader {
                name: name.clone(),
                reason,
            };
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
            let value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
            request.headers_mut().insert(header, value);
        }

        Ok(request)
    }

    /// Opens a fresh transport. Touches no shared state.
    async fn dial(&self) -> Result<(WsWriter, WsReader), ConnectionError> {
        info!("establishing websocket connection to {}...", self.url);

        let request = self.request()?;
        let (ws, _) = match timeout(HANDSHAKE_TIMEOUT, connect_async(request)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(source)) => {
                return Err(ConnectionError::Handshake {
                    url: self.url.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    url: self.url.clone(),
                });
            }
        };

        info!("websocket connection established");
        Ok(ws.split())
    }

    /// Makes `writer` current and closes the previous write half.
    ///
    /// Taking `&mut Section` ties every call to the exclusive section.
    async fn install(&self, _section: &mut Section, writer: WsWriter) {
        let previous = self.writer.lock().await.replace(writer);
        if let Some(previous) = previous {
            close_writer(previous).await;
        }
    }

    /// Timer-triggered replacement.
    ///
    /// Returns `Ok(false)` if the connector is terminating and nothing was
    /// done. On dial failure the read loop resumes on the old transport.
    async fn swap(&self, terminate: &watch::Receiver<bool>) -> Result<bool, ConnectionError> {
        let mut section = self.section.lock().await;
        if *terminate.borrow() {
            return Ok(false);
        }

        self.set_state(ConnectorState::Swapping);

        let parked = match &section.read_loop {
            Some(read_loop) => park_read_loop(read_loop).await,
            None => None,
        };

        // read loop gone or termination requested
        let Some(resume) = parked.filter(|_| !*terminate.borrow()) else {
            self.set_state(ConnectorState::Connected);
            return Ok(false);
        };

        let outcome = match self.dial().await {
            Ok((writer, reader)) => {
                self.install(&mut section, writer).await;
                if resume.send(reader).is_err() {
                    debug!("read loop ended before the swap completed");
                }

                self.swaps.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            // dropping `resume` releases the read loop onto the old transport
            Err(e) => Err(e),
        };

        self.set_state(ConnectorState::Connected);
        outcome
    }

    /// Read-failure-triggered replacement, run by the read loop itself.
    ///
    /// Returns the new read half, or `None` once the connector terminates.
    async fn recover(
        &self,
        swaps: &mut mpsc::Receiver<SwapTicket>,
        terminate: &mut watch::Receiver<bool>,
    ) -> Option<WsReader> {
        let mut backoff = Backoff::new();

        loop {
            let mut section = tokio::select! {
                biased;

                _ = terminated(terminate) => return None,

                // the timer got the section first and brings a transport
                Some(ticket) = swaps.recv() => match ticket.park().await {
                    Some(reader) => return Some(reader),
                    None => continue,
                },

                section = self.section.lock() => section,
            };

            if *terminate.borrow() {
                return None;
            }

            self.set_state(ConnectorState::Swapping);
            backoff.attempted();

            match self.dial().await {
                Ok((writer, reader)) => {
                    if *terminate.borrow() {
                        self.set_state(ConnectorState::Connected);
                        close_writer(writer).await;
                        return None;
                    }

                    self.install(&mut section, writer).await;
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectorState::Connected);
                    warn!("websocket connection replaced after read failure");
                    return Some(reader);
                }
                Err(e) => {
                    self.set_state(ConnectorState::Connected);
                    drop(section);

                    let wait = backoff.next_delay();
                    warn!("websocket reconnect failed: {} - retry in {:?}", e, wait);

                    tokio::select! {
                        biased;
                        _ = terminated(terminate) => return None,
                        Some(ticket) = swaps.recv() => {
                            if let Some(reader) = ticket.park().await {
                                return Some(reader);
                            }
                        }
                        _ = sleep(wait) => {}
                    }
                }
            }
        }
    }
}

/// Sends a swap ticket and waits until the read loop has stopped reading.
///
/// Returns the channel the new read half must be delivered on, or `None` if
/// the read loop is gone.
async fn park_read_loop(
    read_loop: &mpsc::Sender<SwapTicket>,
) -> Option<oneshot::Sender<WsReader>> {
    let (parked_tx, parked_rx) = oneshot::channel();
    let (resume_tx, resume_rx) = oneshot::channel();

    read_loop
        .send(SwapTicket {
            parked: parked_tx,
            resume: resume_rx,
        })
        .await
        .ok()?;
    parked_rx.await.ok()?;

    Some(resume_tx)
}

/// Where the read loop puts the frames it pulls.
enum Outlet {
    /// No `read()` yet.
    Pending {
        held: VecDeque<Message>,
        dropped: u64,
    },
    Attached(mpsc::UnboundedSender<Message>),
    /// The consumer dropped its stream; frames are discarded.
    Detached,
}

impl Outlet {
    fn new() -> Self {
        Outlet::Pending {
            held: VecDeque::new(),
            dropped: 0,
        }
    }

    fn push(&mut self, message: Message) {
        match self {
            Outlet::Pending { held, dropped } => {
                if held.len() < PENDING_LIMIT {
                    held.push_back(message);
                    return;
                }
                if *dropped == 0 {
                    warn!(
                        "no reader attached, dropping frames beyond {}",
                        PENDING_LIMIT
                    );
                }
                *dropped += 1;
            }
            Outlet::Attached(out) => {
                if out.send(message).is_err() {
                    debug!("message stream dropped by consumer");
                    *self = Outlet::Detached;
                }
            }
            Outlet::Detached => {}
        }
    }

    /// Delivers held frames to `out` and forwards everything after them.
    fn attach(&mut self, out: mpsc::UnboundedSender<Message>) {
        let held = match std::mem::replace(self, Outlet::Detached) {
            Outlet::Pending { held, dropped } => {
                if dropped > 0 {
                    warn!("{} frames dropped before read()", dropped);
                }
                held
            }
            _ => VecDeque::new(),
        };

        for message in held {
            if out.send(message).is_err() {
                debug!("message stream dropped by consumer");
                return;
            }
        }
        *self = Outlet::Attached(out);
    }
}

/// Pulls frames off the current transport until terminated.
///
/// Text frames go to the outlet; a failed read replaces the transport.
async fn read_loop(
    shared: Arc<Shared>,
    mut reader: WsReader,
    mut swaps: mpsc::Receiver<SwapTicket>,
    mut terminate: watch::Receiver<bool>,
    attach: oneshot::Receiver<mpsc::UnboundedSender<Message>>,
) {
    let mut attach = Some(attach);
    let mut outlet = Outlet::new();

    loop {
        let failure = tokio::select! {
            biased;

            _ = terminated(&mut terminate) => {
                warn!("read loop received disconnect signal");
                break;
            }

            Some(ticket) = swaps.recv() => {
                debug!("read loop parked for swap");
                if let Some(next) = ticket.park().await {
                    reader = next;
                }
                debug!("read loop resumed");
                continue;
            }

            out = attached(&mut attach) => {
                attach = None;
                if let Some(out) = out {
                    outlet.attach(out);
                }
                continue;
            }

            frame = reader.next() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    outlet.push(text.as_str().to_owned());
                    continue;
                }
                Some(Ok(Frame::Binary(data))) => {
                    outlet.push(String::from_utf8_lossy(&data).into_owned());
                    continue;
                }
                Some(Ok(Frame::Close(frame))) => format!("peer closed connection ({:?})", frame),
                // ping / pong
                Some(Ok(_)) => continue,
                Some(Err(e)) => e.to_string(),
                None => "stream ended".to_string(),
            },
        };

        warn!("websocket read error: {} - replacing connection", failure);
        match shared.recover(&mut swaps, &mut terminate).await {
            Some(next) => reader = next,
            None => break,
        }
    }

    debug!("websocket read loop finished");
}

/// Resolves with the stream `read()` handed over, once.
async fn attached(
    attach: &mut Option<oneshot::Receiver<mpsc::UnboundedSender<Message>>>,
) -> Option<mpsc::UnboundedSender<Message>> {
    match attach {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

/// Swaps the transport on a fixed timer until terminated.
async fn reconnect_loop(
    shared: Arc<Shared>,
    every: Duration,
    mut terminate: watch::Receiver<bool>,
) {
    info!("reconnecting every {:?}", every);

    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = terminated(&mut terminate) => {
                warn!("reconnect loop received disconnect signal");
                break;
            }

            _ = ticker.tick() => {
                warn!("swapping websocket connections...");
                match shared.swap(&terminate).await {
                    Ok(true) => warn!("websocket connection swapped successfully"),
                    Ok(false) => {}
                    Err(e) => error!("websocket swap failed: {}", e),
                }
            }
        }
    }
}

/// Resolves once termination is signalled or its sender is gone.
async fn terminated(terminate: &mut watch::Receiver<bool>) {
    let _ = terminate.wait_for(|stop| *stop).await;
}

async fn close_writer(mut writer: WsWriter) {
    info!("closing websocket connection...");
    match timeout(CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => info!("websocket connection closed"),
        Ok(Err(e)) => warn!("websocket close error: {}", e),
        Err(_) => warn!("websocket close timed out"),
    }
}

fn state_to_u8(state: ConnectorState) -> u8 {
    match state {
        ConnectorState::Disconnected => 0,
        ConnectorState::Connected => 1,
        ConnectorState::Swapping => 2,
    }
}

fn state_from_u8(raw: u8) -> ConnectorState {
    match raw {
        1 => ConnectorState::Connected,
        2 => ConnectorState::Swapping,
        _ => ConnectorState::Disconnected,
    }
}
