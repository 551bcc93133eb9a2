//! BasicStation backend.
//!
//! Terminates long-lived WebSocket connections from concentrator gateways
//! speaking the BasicStation LNS protocol: performs the router-info
//! discovery handshake, pushes the router-config, answers time-sync
//! queries, demultiplexes uplink traffic into typed upstream events and
//! serialises downlink commands back onto the correct socket under write
//! deadlines.

pub mod messages;
pub mod router_config;

mod cache;
mod registry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Host, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use base64::Engine as _;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{
    DownlinkFrame, DownlinkTxAckCallback, GatewayStats, GatewayStatsCallback,
    RawPacketForwarderCommand, RawPacketForwarderEvent, RawPacketForwarderEventCallback,
    Subscribe, SubscribeCallback, UplinkFrame, UplinkFrameCallback,
};
use crate::config::Settings;
use crate::lorawan::{self, gps, Eui64, NetId};
use crate::region::{Band, Region, RegionError};
use crate::tls::{self, ClientCertAcceptor, PeerCertificate, TlsError};

use cache::{Counter, StatsCounters, TtlCache};
use registry::Registry;
use router_config::RouterConfig;

/// Token to downlink-id mappings live for one minute, swept at the same
/// cadence.
const DIID_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend already started")]
    AlreadyStarted,

    #[error("tls requires both tls_cert and tls_key")]
    IncompleteTlsConfig,

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Lorawan(#[from] lorawan::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("gateway {0} does not exist")]
    GatewayNotFound(Eui64),

    #[error("no connection with gateway {0}")]
    GatewayNotConnected(Eui64),

    #[error("connection with the same gateway id already exists: {0}")]
    GatewayAlreadyConnected(Eui64),

    #[error("invalid hex in field {0}")]
    InvalidHexField(&'static str),

    #[error("class-A downlink requires an 8-byte gateway context")]
    InvalidDownlinkContext,

    #[error("router-config requires at least one concentrator")]
    NoConcentrators,

    #[error("too many multi-SF channels: {0} (max 8)")]
    TooManyChannels(usize),

    #[error("raw packet-forwarder command payload is empty")]
    EmptyRawPayload,

    #[error("write deadline expired")]
    WriteTimeout,

    #[error("websocket send error: {0}")]
    SocketSend(String),

    #[error("random token error: {0}")]
    TokenRng(String),
}

enum SinkBackend {
    Socket(SplitSink<WebSocket, Message>),
    #[cfg(test)]
    Mock(mock::MockSink),
}

/// Write half of a gateway connection. Cloneable handle; the inner mutex
/// serialises writes so frames are never interleaved, and every write runs
/// under the configured write deadline.
#[derive(Clone)]
pub(crate) struct GatewayConn {
    sink: Arc<tokio::sync::Mutex<SinkBackend>>,
    write_timeout: Duration,
}

impl GatewayConn {
    fn new(sink: SplitSink<WebSocket, Message>, write_timeout: Duration) -> Self {
        GatewayConn {
            sink: Arc::new(tokio::sync::Mutex::new(SinkBackend::Socket(sink))),
            write_timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn mock(write_timeout: Duration) -> (Self, Arc<mock::MockSinkState>) {
        let (sink, state) = mock::MockSink::new();
        (
            GatewayConn {
                sink: Arc::new(tokio::sync::Mutex::new(SinkBackend::Mock(sink))),
                write_timeout,
            },
            state,
        )
    }

    async fn send(&self, msg: Message) -> Result<(), BackendError> {
        let mut sink = self.sink.lock().await;
        match &mut *sink {
            SinkBackend::Socket(s) => {
                match tokio::time::timeout(self.write_timeout, s.send(msg)).await {
                    Err(_) => Err(BackendError::WriteTimeout),
                    Ok(Err(e)) => Err(BackendError::SocketSend(e.to_string())),
                    Ok(Ok(())) => Ok(()),
                }
            }
            #[cfg(test)]
            SinkBackend::Mock(m) => m.send(msg).await,
        }
    }
}

#[derive(Default)]
struct Handlers {
    uplink_frame: Option<UplinkFrameCallback>,
    downlink_txack: Option<DownlinkTxAckCallback>,
    gateway_stats: Option<GatewayStatsCallback>,
    raw_packet_forwarder_event: Option<RawPacketForwarderEventCallback>,
}

struct BackendState {
    scheme: &'static str,

    stats_interval: Duration,
    ping_interval: Duration,
    read_timeout: Duration,
    write_timeout: Duration,

    band: Band,
    router_config: RouterConfig,

    registry: Registry,
    diid_cache: TtlCache<u32, Uuid>,
    stats: StatsCounters,

    handlers: RwLock<Handlers>,

    tls_config: Option<Arc<rustls::ServerConfig>>,

    single_gw_id: Option<Eui64>,

    is_closed: AtomicBool,
    shutdown_rx: watch::Receiver<bool>,
}

impl BackendState {
    fn single_mode(&self) -> bool {
        self.single_gw_id.is_some()
    }

    async fn send_json_to_gateway<T: Serialize>(
        &self,
        gateway_id: Eui64,
        v: &T,
    ) -> Result<(), BackendError> {
        let conn = self.registry.connection(gateway_id)?;
        let payload = serde_json::to_string(v)?;
        debug!(gateway_id = %gateway_id, message = %payload, "sending message to gateway");
        conn.send(Message::Text(payload)).await
    }
}

/// The BasicStation backend facade.
///
/// Construct from [`Settings`], register upstream callbacks, then
/// [`start`](Backend::start). Callback registration is intended to happen
/// once, before start.
pub struct Backend {
    state: Arc<BackendState>,
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: SocketAddr,
    handle: axum_server::Handle,
    shutdown_tx: watch::Sender<bool>,
}

impl Backend {
    /// Validate the configuration, bind the listener (`:0` is honoured so
    /// tests can discover the assigned port) and precompute the
    /// router-config.
    pub fn new(settings: &Settings) -> Result<Backend, BackendError> {
        let bs = &settings.backend.basic_station;

        let region: Region = bs.region.parse()?;
        let band = Band::for_region(region);

        let mut net_ids: Vec<NetId> = Vec::with_capacity(settings.filters.net_ids.len());
        for s in &settings.filters.net_ids {
            net_ids.push(s.parse()?);
        }

        let mut join_euis: Vec<[Eui64; 2]> = Vec::with_capacity(settings.filters.join_euis.len());
        for pair in &settings.filters.join_euis {
            let lo: Eui64 = pair[0].parse()?;
            let hi: Eui64 = pair[1].parse()?;
            join_euis.push([lo, hi]);
        }

        let router_config = router_config::build(
            &band,
            &net_ids,
            &join_euis,
            bs.frequency_min,
            bs.frequency_max,
            &bs.concentrators,
        )?;

        let tls_config = match (&bs.tls_cert, &bs.tls_key) {
            (Some(cert), Some(key)) => {
                Some(tls::build_server_config(cert, key, bs.ca_cert.as_deref())?)
            }
            (None, None) if bs.ca_cert.is_none() => None,
            _ => return Err(BackendError::IncompleteTlsConfig),
        };

        let single_gw_id = if bs.single.enabled {
            let gw_id: Eui64 = bs.single.gw_id.parse()?;
            info!(gw_id = %gw_id, "operating in single-gateway mode");
            Some(gw_id)
        } else {
            None
        };

        let listener = std::net::TcpListener::bind(&bs.bind).map_err(|e| BackendError::Bind {
            addr: bs.bind.clone(),
            source: e,
        })?;
        listener.set_nonblocking(true).map_err(|e| BackendError::Bind {
            addr: bs.bind.clone(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| BackendError::Bind {
            addr: bs.bind.clone(),
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = Arc::new(BackendState {
            scheme: if tls_config.is_some() { "wss" } else { "ws" },
            stats_interval: bs.stats_interval,
            ping_interval: bs.ping_interval,
            read_timeout: bs.read_timeout,
            write_timeout: bs.write_timeout,
            band,
            router_config,
            registry: Registry::new(),
            diid_cache: TtlCache::new(DIID_CACHE_TTL),
            stats: StatsCounters::new(bs.stats_interval * 2),
            handlers: RwLock::new(Handlers::default()),
            tls_config,
            single_gw_id,
            is_closed: AtomicBool::new(false),
            shutdown_rx,
        });

        Ok(Backend {
            state,
            listener: Mutex::new(Some(listener)),
            local_addr,
            handle: axum_server::Handle::new(),
            shutdown_tx,
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_uplink_frame_callback(&self, f: impl Fn(UplinkFrame) + Send + Sync + 'static) {
        self.state.handlers.write().uplink_frame = Some(Arc::new(f));
    }

    pub fn set_downlink_txack_callback(
        &self,
        f: impl Fn(crate::backend::DownlinkTxAck) + Send + Sync + 'static,
    ) {
        self.state.handlers.write().downlink_txack = Some(Arc::new(f));
    }

    pub fn set_gateway_stats_callback(&self, f: impl Fn(GatewayStats) + Send + Sync + 'static) {
        self.state.handlers.write().gateway_stats = Some(Arc::new(f));
    }

    pub fn set_raw_packet_forwarder_event_callback(
        &self,
        f: impl Fn(RawPacketForwarderEvent) + Send + Sync + 'static,
    ) {
        self.state.handlers.write().raw_packet_forwarder_event = Some(Arc::new(f));
    }

    pub fn set_subscribe_event_callback(&self, f: impl Fn(Subscribe) + Send + Sync + 'static) {
        let cb: SubscribeCallback = Arc::new(f);
        self.state.registry.set_subscribe_callback(cb);
    }

    /// Spawn the serve task (plain or TLS depending on configuration), the
    /// cache sweepers and, in single mode, the permanent stats loop.
    pub fn start(&self) -> Result<(), BackendError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(BackendError::AlreadyStarted)?;

        let state = self.state.clone();
        let app = Router::new()
            .route("/router-info", get(router_info_upgrade))
            .fallback(get(gateway_upgrade))
            .with_state(state.clone());
        let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

        info!(
            bind = %self.local_addr,
            scheme = state.scheme,
            "starting websocket listener"
        );

        let handle = self.handle.clone();
        let serve_state = state.clone();
        match state.tls_config.clone() {
            Some(tls_config) => {
                let acceptor = ClientCertAcceptor::new(tls_config);
                tokio::spawn(async move {
                    let result = axum_server::from_tcp(listener)
                        .acceptor(acceptor)
                        .handle(handle)
                        .serve(make_service)
                        .await;
                    if let Err(e) = result {
                        if !serve_state.is_closed.load(Ordering::SeqCst) {
                            error!(error = %e, "websocket server error");
                        }
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    let result = axum_server::from_tcp(listener)
                        .handle(handle)
                        .serve(make_service)
                        .await;
                    if let Err(e) = result {
                        if !serve_state.is_closed.load(Ordering::SeqCst) {
                            error!(error = %e, "websocket server error");
                        }
                    }
                });
            }
        }

        tokio::spawn(cache_sweeper(state.clone(), state.shutdown_rx.clone()));

        if let Some(gw_id) = state.single_gw_id {
            // Statistics are published for the configured gateway even
            // while no packet forwarder is connected.
            tokio::spawn(stats_loop(state.clone(), gw_id, state.shutdown_rx.clone()));
            if let Err(e) = state.registry.set(gw_id, None) {
                error!(gateway_id = %gw_id, error = %e, "set gateway error");
            }
        }

        Ok(())
    }

    /// Mark the backend closed and shut the listener down. In-flight
    /// connection handlers observe the shutdown signal and run their
    /// cleanup paths.
    pub fn stop(&self) {
        self.state.is_closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.handle.shutdown();
    }

    /// Send a downlink frame to its gateway. A zero token is replaced with
    /// a fresh random 16-bit token; the token→downlink-id mapping is kept
    /// for one minute so the later `dntxed` ack can be correlated.
    pub async fn send_downlink_frame(&self, mut df: DownlinkFrame) -> Result<(), BackendError> {
        if df.token == 0 {
            let mut b = [0u8; 2];
            rand::rngs::OsRng
                .try_fill_bytes(&mut b)
                .map_err(|e| BackendError::TokenRng(e.to_string()))?;
            df.token = u16::from_be_bytes(b) as u32;
        }

        let msg = messages::downlink_message_from_frame(&self.state.band, &df)?;

        self.state.diid_cache.insert(df.token, df.downlink_id);
        self.state.stats.increment(df.gateway_id, Counter::Tx);

        self.state.send_json_to_gateway(df.gateway_id, &msg).await?;

        info!(
            gateway_id = %df.gateway_id,
            downlink_id = %df.downlink_id,
            "downlink-frame message sent to gateway"
        );
        Ok(())
    }

    /// Pass a raw command through to the packet forwarder unmodified. A
    /// payload starting with `{` is sent as a text frame, anything else as
    /// binary.
    pub async fn send_raw_packet_forwarder_command(
        &self,
        cmd: RawPacketForwarderCommand,
    ) -> Result<(), BackendError> {
        if cmd.payload.is_empty() {
            return Err(BackendError::EmptyRawPayload);
        }

        let msg = if cmd.payload.first() == Some(&b'{') {
            Message::Text(String::from_utf8_lossy(&cmd.payload).into_owned())
        } else {
            Message::Binary(cmd.payload.clone())
        };

        let conn = self.state.registry.connection(cmd.gateway_id)?;
        conn.send(msg).await?;

        info!(
            gateway_id = %cmd.gateway_id,
            raw_id = %cmd.raw_id,
            "raw packet-forwarder command sent to gateway"
        );
        Ok(())
    }
}

async fn router_info_upgrade(
    State(state): State<Arc<BackendState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Host(host): Host,
    peer: Option<Extension<PeerCertificate>>,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = peer.map(|Extension(p)| p);
    ws.on_upgrade(move |socket| handle_router_info(state, remote, host, peer, socket))
}

/// Read exactly one router-info request and answer with the URI of the
/// gateway endpoint; the connection closes on return.
async fn handle_router_info(
    state: Arc<BackendState>,
    remote: SocketAddr,
    host: String,
    peer: Option<PeerCertificate>,
    socket: WebSocket,
) {
    let (sink, mut stream) = socket.split();
    let conn = GatewayConn::new(sink, state.write_timeout);

    let text = match tokio::time::timeout(state.read_timeout, stream.next()).await {
        Err(_) => {
            warn!(remote_addr = %remote, "router-info read deadline expired");
            return;
        }
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            error!(remote_addr = %remote, "unexpected router-info frame type");
            return;
        }
        Ok(Some(Err(e))) => {
            error!(remote_addr = %remote, error = %e, "read message error");
            return;
        }
        Ok(None) => return,
    };

    let req: messages::RouterInfoRequest = match serde_json::from_str(&text) {
        Ok(req) => req,
        Err(e) => {
            error!(remote_addr = %remote, error = %e, "unmarshal router-info request error");
            return;
        }
    };

    let mut resp = messages::RouterInfoResponse {
        router: req.router,
        muxs: req.router,
        uri: format!("{}://{}/gateway/{}", state.scheme, host, req.router.to_hex()),
        error: String::new(),
    };

    if let Some(peer) = &peer {
        if let Some(cn) = &peer.common_name {
            if cn.parse::<Eui64>().ok() != Some(req.router) {
                resp.uri = String::new();
                resp.error = format!(
                    "certificate CommonName {} does not match router {}",
                    cn,
                    req.router.to_hex()
                );
            }
        }
    }

    let payload = match serde_json::to_string(&resp) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "marshal json error");
            return;
        }
    };
    if let Err(e) = conn.send(Message::Text(payload)).await {
        error!(remote_addr = %remote, error = %e, "websocket send message error");
        return;
    }

    info!(
        gateway_id = %req.router,
        remote_addr = %remote,
        router_uri = %resp.uri,
        "router-info request received"
    );
}

async fn gateway_upgrade(
    State(state): State<Arc<BackendState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    peer: Option<Extension<PeerCertificate>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    // The gateway EUI is the last path segment, whatever prefix the
    // station was configured with.
    let tail = uri.path().trim_end_matches('/').rsplit('/').next();
    let gateway_id: Eui64 = match tail.map(str::parse) {
        Some(Ok(eui)) => eui,
        _ => {
            error!(url = %uri.path(), "unable to read gateway id from url");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if let Some(Extension(peer)) = &peer {
        if let Some(cn) = &peer.common_name {
            if cn.parse::<Eui64>().ok() != Some(gateway_id) {
                error!(
                    gateway_id = %gateway_id,
                    common_name = %cn,
                    "CommonName verification failed"
                );
                return StatusCode::FORBIDDEN.into_response();
            }
        }
    }

    ws.on_upgrade(move |socket| handle_gateway(state, remote, gateway_id, socket))
}

/// Per-gateway connection task: registers the connection, runs the ping
/// and stats loops, then reads frames until the socket closes. Cleanup
/// order on any exit path: stop stats loop, deregister, stop ping.
async fn handle_gateway(
    state: Arc<BackendState>,
    remote: SocketAddr,
    gateway_id: Eui64,
    socket: WebSocket,
) {
    if state.single_mode() && state.single_gw_id != Some(gateway_id) {
        warn!(
            gateway_id = %gateway_id,
            "bridge operates in single-gateway mode; connection for other id rejected"
        );
        return;
    }

    let (sink, stream) = socket.split();
    let conn = GatewayConn::new(sink, state.write_timeout);

    let (close_tx, close_rx) = watch::channel(false);
    let ping_task = tokio::spawn(ping_loop(
        state.clone(),
        conn.clone(),
        close_tx.clone(),
        close_rx.clone(),
    ));

    if let Err(e) = state.registry.set(gateway_id, Some(conn)) {
        error!(gateway_id = %gateway_id, error = %e, "set gateway error");
        let _ = close_tx.send(true);
        let _ = ping_task.await;
        return;
    }

    info!(gateway_id = %gateway_id, remote_addr = %remote, "gateway connected");

    // In single mode the permanent stats loop was started at backend
    // start; everyone else gets one per connection.
    let (stats_tx, stats_task) = if state.single_mode() {
        (None, None)
    } else {
        let (tx, rx) = watch::channel(false);
        (
            Some(tx),
            Some(tokio::spawn(stats_loop(state.clone(), gateway_id, rx))),
        )
    };

    read_loop(&state, gateway_id, stream, close_rx).await;

    if let Some(tx) = stats_tx {
        let _ = tx.send(true);
    }
    if let Some(task) = stats_task {
        let _ = task.await;
    }

    if state.single_mode() {
        state.registry.reset(gateway_id);
        info!(
            gateway_id = %gateway_id,
            remote_addr = %remote,
            "gateway disconnected, connection reset (single mode)"
        );
    } else {
        state.registry.remove(gateway_id);
        info!(
            gateway_id = %gateway_id,
            remote_addr = %remote,
            "gateway disconnected, removed"
        );
    }

    let _ = close_tx.send(true);
    let _ = ping_task.await;
}

/// Send a ping every ping-interval. A failed ping closes the connection,
/// which unblocks the read loop and triggers cleanup.
async fn ping_loop(
    state: Arc<BackendState>,
    conn: GatewayConn,
    close_tx: watch::Sender<bool>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(state.ping_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = conn.send(Message::Ping(Vec::new())).await {
                    error!(error = %e, "send ping message error");
                    let _ = close_tx.send(true);
                    return;
                }
            }
            _ = close_rx.changed() => return,
        }
    }
}

/// Read frames until the socket closes, a deadline expires or shutdown is
/// signalled. The read deadline re-arms on every inbound frame, pongs
/// included (the station does not reliably answer pings, so any traffic
/// counts as liveness).
async fn read_loop(
    state: &Arc<BackendState>,
    gateway_id: Eui64,
    mut stream: SplitStream<WebSocket>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut shutdown_rx = state.shutdown_rx.clone();
    loop {
        let msg = tokio::select! {
            _ = close_rx.changed() => return,
            _ = shutdown_rx.changed() => return,
            res = tokio::time::timeout(state.read_timeout, stream.next()) => match res {
                Err(_) => {
                    warn!(gateway_id = %gateway_id, "read deadline expired");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    error!(gateway_id = %gateway_id, error = %e, "read message error");
                    return;
                }
                Ok(Some(Ok(msg))) => msg,
            },
        };

        match msg {
            Message::Binary(payload) => {
                debug!(
                    gateway_id = %gateway_id,
                    message_base64 = %base64::engine::general_purpose::STANDARD.encode(&payload),
                    "binary message received"
                );
                handle_raw_packet_forwarder_event(state, gateway_id, payload);
            }
            Message::Text(text) => {
                debug!(gateway_id = %gateway_id, message = %text, "message received");
                dispatch_text(state, gateway_id, &text).await;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return,
        }
    }
}

/// Classify a text frame by its `msgtype` discriminator and run the
/// matching handler. Decode failures log and drop the message; the
/// connection continues.
async fn dispatch_text(state: &Arc<BackendState>, gateway_id: Eui64, text: &str) {
    let msgtype = match messages::message_type(text) {
        Ok(t) => t,
        Err(e) => {
            error!(
                gateway_id = %gateway_id,
                payload = %text,
                error = %e,
                "get message-type error"
            );
            return;
        }
    };

    match messages::MessageType::from_wire(&msgtype) {
        Some(messages::MessageType::Version) => {
            match serde_json::from_str::<messages::Version>(text) {
                Ok(pl) => handle_version(state, gateway_id, pl).await,
                Err(e) => log_decode_error(gateway_id, &msgtype, text, &e),
            }
        }
        Some(messages::MessageType::Updf) => {
            state.stats.increment(gateway_id, Counter::Rx);
            state.stats.increment(gateway_id, Counter::RxOk);
            match serde_json::from_str::<messages::UplinkDataFrame>(text) {
                Ok(pl) => handle_uplink_data_frame(state, gateway_id, pl),
                Err(e) => log_decode_error(gateway_id, &msgtype, text, &e),
            }
        }
        Some(messages::MessageType::Jreq) => {
            state.stats.increment(gateway_id, Counter::Rx);
            state.stats.increment(gateway_id, Counter::RxOk);
            match serde_json::from_str::<messages::JoinRequest>(text) {
                Ok(pl) => handle_join_request(state, gateway_id, pl),
                Err(e) => log_decode_error(gateway_id, &msgtype, text, &e),
            }
        }
        Some(messages::MessageType::Propdf) => {
            state.stats.increment(gateway_id, Counter::Rx);
            state.stats.increment(gateway_id, Counter::RxOk);
            match serde_json::from_str::<messages::UplinkProprietaryFrame>(text) {
                Ok(pl) => handle_proprietary_data_frame(state, gateway_id, pl),
                Err(e) => log_decode_error(gateway_id, &msgtype, text, &e),
            }
        }
        Some(messages::MessageType::Dntxed) => {
            state.stats.increment(gateway_id, Counter::TxOk);
            match serde_json::from_str::<messages::DownlinkTransmitted>(text) {
                Ok(pl) => handle_downlink_transmitted(state, gateway_id, pl),
                Err(e) => log_decode_error(gateway_id, &msgtype, text, &e),
            }
        }
        Some(messages::MessageType::Timesync) => {
            match serde_json::from_str::<messages::TimeSyncRequest>(text) {
                Ok(pl) => handle_time_sync(state, gateway_id, pl).await,
                Err(e) => log_decode_error(gateway_id, &msgtype, text, &e),
            }
        }
        // router_config and dnmsg only ever flow server-to-station; a
        // station echoing them is forwarded raw like any unknown type.
        Some(messages::MessageType::RouterConfig)
        | Some(messages::MessageType::Dnmsg)
        | None => handle_raw_packet_forwarder_event(state, gateway_id, text.as_bytes().to_vec()),
    }
}

fn log_decode_error(gateway_id: Eui64, msgtype: &str, payload: &str, e: &serde_json::Error) {
    error!(
        gateway_id = %gateway_id,
        message_type = msgtype,
        payload = %payload,
        error = %e,
        "unmarshal json message error"
    );
}

async fn handle_version(state: &Arc<BackendState>, gateway_id: Eui64, pl: messages::Version) {
    info!(
        gateway_id = %gateway_id,
        station = pl.station.as_deref().unwrap_or(""),
        firmware = pl.firmware.as_deref().unwrap_or(""),
        package = pl.package.as_deref().unwrap_or(""),
        model = pl.model.as_deref().unwrap_or(""),
        protocol = pl.protocol.unwrap_or(0),
        features = pl.features.as_deref().unwrap_or(""),
        "gateway version received"
    );

    if let Err(e) = state
        .send_json_to_gateway(gateway_id, &state.router_config)
        .await
    {
        error!(gateway_id = %gateway_id, error = %e, "send to gateway error");
        return;
    }

    info!(gateway_id = %gateway_id, "router-config message sent to gateway");
}

fn handle_uplink_data_frame(
    state: &Arc<BackendState>,
    gateway_id: Eui64,
    pl: messages::UplinkDataFrame,
) {
    let uplink_id = Uuid::new_v4();
    let frame = match messages::uplink_frame_from_updf(&state.band, gateway_id, uplink_id, &pl) {
        Ok(frame) => frame,
        Err(e) => {
            error!(gateway_id = %gateway_id, error = %e, "error converting uplink frame");
            return;
        }
    };

    info!(gateway_id = %gateway_id, uplink_id = %uplink_id, "uplink frame received");
    emit_uplink(state, frame);
}

fn handle_join_request(state: &Arc<BackendState>, gateway_id: Eui64, pl: messages::JoinRequest) {
    let uplink_id = Uuid::new_v4();
    let frame = match messages::uplink_frame_from_jreq(&state.band, gateway_id, uplink_id, &pl) {
        Ok(frame) => frame,
        Err(e) => {
            error!(gateway_id = %gateway_id, error = %e, "error converting join-request");
            return;
        }
    };

    info!(gateway_id = %gateway_id, uplink_id = %uplink_id, "join-request received");
    emit_uplink(state, frame);
}

fn handle_proprietary_data_frame(
    state: &Arc<BackendState>,
    gateway_id: Eui64,
    pl: messages::UplinkProprietaryFrame,
) {
    let uplink_id = Uuid::new_v4();
    let frame = match messages::uplink_frame_from_propdf(&state.band, gateway_id, uplink_id, &pl) {
        Ok(frame) => frame,
        Err(e) => {
            error!(gateway_id = %gateway_id, error = %e, "error converting proprietary uplink");
            return;
        }
    };

    info!(
        gateway_id = %gateway_id,
        uplink_id = %uplink_id,
        "proprietary uplink frame received"
    );
    emit_uplink(state, frame);
}

fn emit_uplink(state: &Arc<BackendState>, frame: UplinkFrame) {
    let cb = state.handlers.read().uplink_frame.clone();
    if let Some(cb) = cb {
        cb(frame);
    }
}

fn handle_downlink_transmitted(
    state: &Arc<BackendState>,
    gateway_id: Eui64,
    pl: messages::DownlinkTransmitted,
) {
    let mut ack = messages::downlink_txack_from_dntxed(gateway_id, &pl);
    if let Some(downlink_id) = state.diid_cache.get(&ack.token) {
        ack.downlink_id = Some(downlink_id);
    }

    info!(
        gateway_id = %gateway_id,
        downlink_id = %ack.downlink_id.unwrap_or_default(),
        "downlink transmitted message received"
    );

    let cb = state.handlers.read().downlink_txack.clone();
    if let Some(cb) = cb {
        cb(ack);
    }
}

async fn handle_time_sync(
    state: &Arc<BackendState>,
    gateway_id: Eui64,
    pl: messages::TimeSyncRequest,
) {
    let resp = messages::TimeSyncResponse {
        msgtype: messages::MessageType::Timesync,
        txtime: pl.txtime,
        gpstime: gps::time_since_gps_epoch(Utc::now()).as_micros() as i64,
    };

    if let Err(e) = state.send_json_to_gateway(gateway_id, &resp).await {
        error!(gateway_id = %gateway_id, error = %e, "send to gateway error");
        return;
    }

    info!(
        gateway_id = %gateway_id,
        txtime = resp.txtime,
        gpstime = resp.gpstime,
        "timesync message sent to gateway"
    );
}

fn handle_raw_packet_forwarder_event(
    state: &Arc<BackendState>,
    gateway_id: Eui64,
    payload: Vec<u8>,
) {
    let raw_id = Uuid::new_v4();
    info!(
        gateway_id = %gateway_id,
        raw_id = %raw_id,
        "raw packet-forwarder event received"
    );

    let cb = state.handlers.read().raw_packet_forwarder_event.clone();
    if let Some(cb) = cb {
        cb(RawPacketForwarderEvent {
            gateway_id,
            raw_id,
            payload,
        });
    }
}

/// Flush the gateway's counters into a GatewayStats event every
/// stats-interval until `done` is signalled.
async fn stats_loop(state: Arc<BackendState>, gateway_id: Eui64, mut done: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(state.stats_interval);
    // The first tick of a tokio interval completes immediately; consume it
    // so stats are first published one full interval after start.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = state.stats.take_snapshot(gateway_id);
                let stats = GatewayStats {
                    gateway_id,
                    time: Utc::now(),
                    stats_id: Uuid::new_v4(),
                    rx_packets_received: snapshot.rx,
                    rx_packets_received_ok: snapshot.rx_ok,
                    tx_packets_received: snapshot.tx,
                    tx_packets_emitted: snapshot.tx_ok,
                };
                let cb = state.handlers.read().gateway_stats.clone();
                if let Some(cb) = cb {
                    cb(stats);
                }
            }
            _ = done.changed() => return,
        }
    }
}

/// Evict expired cache entries at their sweep cadences.
async fn cache_sweeper(state: Arc<BackendState>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut diid_ticker = tokio::time::interval(DIID_CACHE_TTL);
    let mut stats_ticker = tokio::time::interval(state.stats_interval * 2);
    diid_ticker.tick().await;
    stats_ticker.tick().await;

    loop {
        tokio::select! {
            _ = diid_ticker.tick() => state.diid_cache.sweep(),
            _ = stats_ticker.tick() => state.stats.sweep(),
            _ = shutdown_rx.changed() => return,
        }
    }
}
