//! One authenticated duplex connection to the proxy.
//!
//! Each socket runs as its own task: fetch the online hash, connect, log in,
//! then pump frames until the connection dies, and start over while the
//! socket is still wanted. The owner talks to it through a [`SocketHandle`]
//! and hears back through a stream of [`SocketEvent`]s.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::auth::{Authenticator, Credentials};
use super::protocol::{parse_response, Payload, RequestEnvelope, Resource, Response};
use super::transport::{Connector, FrameChannel};

pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(40);
pub const LOGIN_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESYNC_TIMEOUT: Duration = Duration::from_secs(20);
pub const LOGIN_RETRY_TIMEOUT: Duration = Duration::from_secs(5);
pub const HASH_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

const PROFILE: &str = "WEB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketStatus {
    Hash = 0,
    Connecting = 1,
    Connected = 2,
    NotAuthorized = 3,
    Closed = 4,
    Ready = 5,
}

impl SocketStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SocketStatus::Hash,
            1 => SocketStatus::Connecting,
            2 => SocketStatus::Connected,
            3 => SocketStatus::NotAuthorized,
            5 => SocketStatus::Ready,
            _ => SocketStatus::Closed,
        }
    }
}

/// What an idle socket sends to keep the connection warm.
#[derive(Debug, Clone)]
pub enum SocketMode {
    /// Session sync, skipped while `sync` is off (jackpot windows).
    Competition { sync: Arc<AtomicBool> },
    /// Lookup of the last ten tickets.
    Ticket,
}

#[derive(Debug)]
pub enum SocketEvent {
    /// Logged in; carries the login response body.
    Online(Value),
    /// Login rejected; the socket will retry.
    Unauthorized(Value),
    /// Connection dropped; the socket is reconnecting.
    Lost,
    /// Closed for good.
    Offline,
    Response(Response),
}

/// Everything a socket needs from its surroundings.
#[derive(Clone)]
pub struct Remote {
    pub auth: Arc<dyn Authenticator>,
    pub connector: Arc<dyn Connector>,
    /// Proxy origin echoed in every request envelope.
    pub proxy_host: String,
}

pub struct SocketSpec {
    pub id: u32,
    pub username: String,
    pub credentials: Credentials,
    pub host: Option<String>,
    pub mode: SocketMode,
}

struct Shared {
    xs: AtomicU64,
    status: AtomicU8,
    connected: AtomicBool,
    authorized: AtomicBool,
    last_used: AtomicI64,
}

impl Shared {
    /// Sequence numbers start at 1.
    fn next_xs(&self) -> u64 {
        self.xs.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_status(&self, status: SocketStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }
}

struct Outbound {
    xs: u64,
    resource: Resource,
    payload: Payload,
}

/// Cheap, cloneable handle to a running socket task.
#[derive(Clone)]
pub struct SocketHandle {
    id: u32,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    alive: Arc<watch::Sender<bool>>,
}

impl SocketHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn status(&self) -> SocketStatus {
        SocketStatus::from_u8(self.shared.status.load(Ordering::SeqCst))
    }

    pub fn is_authorized(&self) -> bool {
        self.shared.authorized.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Milliseconds since the epoch of the last [`touch`](Self::touch).
    pub fn last_used(&self) -> i64 {
        self.shared.last_used.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.shared
            .last_used
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Queue a request. Returns the `xs` the response will carry, or `None`
    /// while the socket is not connected.
    pub fn send(&self, resource: Resource, payload: Payload) -> Option<u64> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return None;
        }
        let xs = self.shared.next_xs();
        self.outbound
            .send(Outbound {
                xs,
                resource,
                payload,
            })
            .ok()?;
        Some(xs)
    }

    pub fn sync(&self) -> Option<u64> {
        self.send(Resource::Sync, Payload::Query(json!({})))
    }

    /// Tear the socket down. It reports [`SocketEvent::Offline`] and does
    /// not reconnect.
    pub fn close(&self) {
        self.alive.send_replace(false);
    }
}

enum Read {
    Frame(String),
    Timeout,
    Closed,
}

enum Step {
    Inbound(Option<Result<String>>),
    Outbound(Outbound),
    Timeout,
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    LoginTimeout,
    MessageTimeout,
    NotAuthorized,
}

pub struct Socket {
    spec: SocketSpec,
    remote: Remote,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SocketEvent>,
    alive: watch::Receiver<bool>,
    client_id: String,
    online_hash: String,
}

impl Socket {
    /// Start a socket task. The receiver yields everything the socket has
    /// to say until it goes [`SocketEvent::Offline`].
    pub fn spawn(spec: SocketSpec, remote: Remote) -> (SocketHandle, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (alive_tx, alive_rx) = watch::channel(true);
        let shared = Arc::new(Shared {
            xs: AtomicU64::new(0),
            status: AtomicU8::new(SocketStatus::Closed as u8),
            connected: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            last_used: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        let handle = SocketHandle {
            id: spec.id,
            shared: shared.clone(),
            outbound: outbound_tx,
            alive: Arc::new(alive_tx),
        };
        let socket = Socket {
            spec,
            remote,
            shared,
            events: events_tx,
            alive: alive_rx,
            client_id: String::new(),
            online_hash: String::new(),
        };
        tokio::spawn(socket.run(outbound_rx));
        (handle, events_rx)
    }

    fn tag(&self) -> String {
        format!("[{}:{}]", self.spec.username, self.spec.id)
    }

    fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    async fn run(mut self, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        while self.is_alive() {
            self.shared.set_status(SocketStatus::Hash);
            let Some(hash) = self.fetch_hash().await else {
                break;
            };
            self.online_hash = hash;

            self.shared.set_status(SocketStatus::Connecting);
            let Some(mut channel) = self.open().await else {
                break;
            };

            let end = self.session(channel.as_mut(), &mut outbound).await;
            channel.close().await;
            self.shared.connected.store(false, Ordering::SeqCst);
            self.shared.authorized.store(false, Ordering::SeqCst);
            if end != SessionEnd::NotAuthorized {
                self.shared.set_status(SocketStatus::Closed);
            }
            debug!("{} socket disconnected [{}] {:?}", self.tag(), self.online_hash, end);

            if !self.is_alive() {
                break;
            }
            let _ = self.events.send(SocketEvent::Lost);
            debug!("{} restarting socket", self.tag());
            if end == SessionEnd::NotAuthorized && !self.pause(LOGIN_RETRY_TIMEOUT).await {
                break;
            }
        }
        self.shared.set_status(SocketStatus::Closed);
        let _ = self.events.send(SocketEvent::Offline);
    }

    /// Sleep unless the socket is torn down first. `false` means torn down.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = wait_closed(&mut self.alive) => false,
        }
    }

    async fn fetch_hash(&mut self) -> Option<String> {
        loop {
            let attempt = tokio::select! {
                r = self.remote.auth.login_hash(&self.spec.username, &self.spec.credentials) => r,
                _ = wait_closed(&mut self.alive) => return None,
            };
            match attempt {
                Ok(hash) => return Some(hash),
                Err(e) => {
                    error!("{} get-hash {:#}", self.tag(), e);
                    if !self.pause(HASH_RETRY_TIMEOUT).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn open(&mut self) -> Option<Box<dyn FrameChannel>> {
        loop {
            info!("{} opening socket [{}]", self.tag(), self.online_hash);
            let attempt = tokio::select! {
                r = self.remote.connector.connect(self.spec.host.as_deref()) => r,
                _ = wait_closed(&mut self.alive) => return None,
            };
            match attempt {
                Ok(channel) => return Some(channel),
                Err(e) => {
                    warn!("{} websocket connection failed {:#}", self.tag(), e);
                    if !self.pause(LOGIN_RETRY_TIMEOUT).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn session(
        &mut self,
        channel: &mut dyn FrameChannel,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> SessionEnd {
        // requests queued against the previous connection are stale
        while outbound.try_recv().is_ok() {}

        self.client_id.clear();
        self.shared.set_status(SocketStatus::Connected);
        self.shared.connected.store(true, Ordering::SeqCst);
        debug!("{} socket connected [{}]", self.tag(), self.online_hash);

        let login = json!({ "onlineHash": self.online_hash, "profile": PROFILE });
        let xs = self.shared.next_xs();
        if let Err(e) = self.write(channel, xs, Resource::Login, Payload::Query(login)).await {
            warn!("{} login send failed {:#}", self.tag(), e);
            return SessionEnd::Closed;
        }

        loop {
            match self.read(channel, outbound, LOGIN_CLOSE_TIMEOUT).await {
                Read::Frame(text) => match parse_response(&text) {
                    Some(resp) if resp.resource == Some(Resource::Login) => {
                        if self.on_login(resp) {
                            break;
                        }
                        return SessionEnd::NotAuthorized;
                    }
                    Some(resp) => self.forward(resp),
                    None => debug!("{} undecodable frame", self.tag()),
                },
                Read::Timeout => {
                    warn!("{} socket login timeout", self.tag());
                    return SessionEnd::LoginTimeout;
                }
                Read::Closed => return SessionEnd::Closed,
            }
        }

        loop {
            match self.read(channel, outbound, CLOSE_TIMEOUT).await {
                Read::Frame(text) => self.dispatch(&text),
                Read::Timeout => {
                    self.heartbeat(channel).await;
                    match self.read(channel, outbound, RESYNC_TIMEOUT).await {
                        Read::Frame(text) => self.dispatch(&text),
                        Read::Timeout => {
                            debug!("{} socket message timeout", self.tag());
                            return SessionEnd::MessageTimeout;
                        }
                        Read::Closed => return SessionEnd::Closed,
                    }
                }
                Read::Closed => return SessionEnd::Closed,
            }
        }
    }

    /// Wait up to `timeout` for an inbound frame, flushing queued requests
    /// meanwhile. Outbound traffic does not extend the deadline.
    async fn read(
        &mut self,
        channel: &mut dyn FrameChannel,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
        timeout: Duration,
    ) -> Read {
        let deadline = Instant::now() + timeout;
        loop {
            let step = tokio::select! {
                frame = channel.recv() => Step::Inbound(frame),
                Some(out) = outbound.recv() => Step::Outbound(out),
                _ = tokio::time::sleep_until(deadline) => Step::Timeout,
                _ = wait_closed(&mut self.alive) => Step::Shutdown,
            };
            match step {
                Step::Inbound(Some(Ok(text))) => return Read::Frame(text),
                Step::Inbound(Some(Err(e))) => {
                    warn!("{} websocket connection error : {:#}", self.tag(), e);
                    return Read::Closed;
                }
                Step::Inbound(None) => {
                    debug!("{} websocket connection closed", self.tag());
                    return Read::Closed;
                }
                Step::Outbound(out) => {
                    if let Err(e) = self.write(channel, out.xs, out.resource, out.payload).await {
                        warn!("{} websocket send failed : {:#}", self.tag(), e);
                        return Read::Closed;
                    }
                }
                Step::Timeout => return Read::Timeout,
                Step::Shutdown => return Read::Closed,
            }
        }
    }

    async fn write(
        &self,
        channel: &mut dyn FrameChannel,
        xs: u64,
        resource: Resource,
        payload: Payload,
    ) -> Result<()> {
        let envelope = RequestEnvelope::new(xs, resource, payload, &self.client_id, &self.remote.proxy_host);
        let text = serde_json::to_string(&envelope)?;
        channel.send(text).await
    }

    async fn heartbeat(&self, channel: &mut dyn FrameChannel) {
        let request = match &self.spec.mode {
            SocketMode::Competition { sync } => {
                if !sync.load(Ordering::SeqCst) {
                    return;
                }
                (Resource::Sync, json!({}))
            }
            SocketMode::Ticket => (Resource::TicketsFindById, json!({ "n": 10, "filter": null })),
        };
        let xs = self.shared.next_xs();
        if let Err(e) = self.write(channel, xs, request.0, Payload::Query(request.1)).await {
            debug!("{} heartbeat send failed {:#}", self.tag(), e);
        }
    }

    fn dispatch(&mut self, text: &str) {
        match parse_response(text) {
            Some(resp) if resp.resource == Some(Resource::Login) => {
                self.on_login(resp);
            }
            Some(resp) => self.forward(resp),
            None => debug!("{} undecodable frame", self.tag()),
        }
    }

    fn forward(&self, resp: Response) {
        let _ = self.events.send(SocketEvent::Response(resp));
    }

    fn on_login(&mut self, resp: Response) -> bool {
        let client_id = resp
            .body
            .get("clientId")
            .and_then(|v| v.as_str())
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        match client_id {
            Some(client_id) if resp.valid => {
                self.client_id = client_id;
                info!("{} socket auth success [{}]", self.tag(), self.online_hash);
                self.shared.authorized.store(true, Ordering::SeqCst);
                self.shared.set_status(SocketStatus::Ready);
                let _ = self.events.send(SocketEvent::Online(resp.body));
                true
            }
            _ => {
                error!(
                    "{} authentication failed [{}] {}",
                    self.tag(),
                    self.online_hash,
                    resp.body
                );
                self.shared.set_status(SocketStatus::NotAuthorized);
                let _ = self.events.send(SocketEvent::Unauthorized(resp.body));
                false
            }
        }
    }
}

/// Resolves once the socket is torn down (or every handle is gone).
async fn wait_closed(alive: &mut watch::Receiver<bool>) {
    loop {
        if !*alive.borrow_and_update() {
            return;
        }
        if alive.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockAuth;

    #[async_trait]
    impl Authenticator for MockAuth {
        async fn login(&self, _username: &str, _password: &str) -> Result<Credentials> {
            Ok(Credentials::default())
        }

        async fn login_hash(&self, _username: &str, _credentials: &Credentials) -> Result<String> {
            Ok("hash".into())
        }
    }

    /// Answers every login frame; otherwise stays silent.
    struct MockChannel {
        conn: usize,
        accept: bool,
        inbound: mpsc::UnboundedReceiver<String>,
        loopback: mpsc::UnboundedSender<String>,
        sent: mpsc::UnboundedSender<(usize, Value)>,
    }

    #[async_trait]
    impl FrameChannel for MockChannel {
        async fn recv(&mut self) -> Option<Result<String>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn send(&mut self, text: String) -> Result<()> {
            let frame: Value = serde_json::from_str(&text)?;
            if frame["req"]["resource"] == "/session/login" {
                let body = if self.accept {
                    json!({"clientId": format!("client-{}", self.conn)})
                } else {
                    json!({"error": "bad hash"})
                };
                let reply = json!({
                    "xs": frame["xs"],
                    "res": {"statusCode": 200, "validResponse": true,
                            "resource": "/session/login", "body": body}
                });
                let _ = self.loopback.send(reply.to_string());
            }
            let _ = self.sent.send((self.conn, frame));
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct MockConnector {
        accept: bool,
        conns: Mutex<usize>,
        sent: mpsc::UnboundedSender<(usize, Value)>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _host: Option<&str>) -> Result<Box<dyn FrameChannel>> {
            let conn = {
                let mut n = self.conns.lock().unwrap();
                *n += 1;
                *n
            };
            let (tx, rx) = mpsc::unbounded_channel();
            Ok(Box::new(MockChannel {
                conn,
                accept: self.accept,
                inbound: rx,
                loopback: tx,
                sent: self.sent.clone(),
            }))
        }
    }

    fn start(
        accept: bool,
        mode: SocketMode,
    ) -> (
        SocketHandle,
        mpsc::UnboundedReceiver<SocketEvent>,
        mpsc::UnboundedReceiver<(usize, Value)>,
    ) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let remote = Remote {
            auth: Arc::new(MockAuth),
            connector: Arc::new(MockConnector {
                accept,
                conns: Mutex::new(0),
                sent: sent_tx,
            }),
            proxy_host: "wss://proxy:9443".into(),
        };
        let spec = SocketSpec {
            id: 1,
            username: "0700000000".into(),
            credentials: Credentials::default(),
            host: None,
            mode,
        };
        let (handle, events) = Socket::spawn(spec, remote);
        (handle, events, sent_rx)
    }

    fn resource(frame: &Value) -> &str {
        frame["req"]["resource"].as_str().unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn idle_socket_resyncs_once_then_reconnects() {
        let sync = Arc::new(AtomicBool::new(true));
        let (handle, mut events, mut sent) = start(true, SocketMode::Competition { sync });

        let (conn, login) = sent.recv().await.unwrap();
        assert_eq!((conn, resource(&login)), (1, "/session/login"));
        assert!(login["req"]["headers"].get("clientId").is_none());
        assert!(matches!(events.recv().await, Some(SocketEvent::Online(_))));
        assert!(handle.is_authorized());
        assert_eq!(handle.status(), SocketStatus::Ready);

        let started = Instant::now();
        let (conn, resync) = sent.recv().await.unwrap();
        assert_eq!((conn, resource(&resync)), (1, "/session/sync"));
        assert_eq!(resync["req"]["headers"]["clientId"], "client-1");
        assert!(started.elapsed() >= CLOSE_TIMEOUT);

        // the next frame is already the second connection's login
        let (conn, relogin) = sent.recv().await.unwrap();
        assert_eq!((conn, resource(&relogin)), (2, "/session/login"));
        assert!(started.elapsed() >= CLOSE_TIMEOUT + RESYNC_TIMEOUT);
        assert!(matches!(events.recv().await, Some(SocketEvent::Lost)));
        assert!(matches!(events.recv().await, Some(SocketEvent::Online(_))));

        handle.close();
        loop {
            match events.recv().await {
                Some(SocketEvent::Offline) => break,
                Some(SocketEvent::Lost) => panic!("closed socket must not report lost"),
                Some(_) => {}
                None => panic!("socket ended without going offline"),
            }
        }
        assert_eq!(handle.status(), SocketStatus::Closed);
        assert!(handle.send(Resource::Sync, Payload::Query(json!({}))).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ticket_socket_heartbeat_asks_for_last_tickets() {
        let (handle, mut events, mut sent) = start(true, SocketMode::Ticket);
        let _ = sent.recv().await.unwrap();
        assert!(matches!(events.recv().await, Some(SocketEvent::Online(_))));

        let (_, beat) = sent.recv().await.unwrap();
        assert_eq!(resource(&beat), "/tickets/findById");
        assert_eq!(beat["req"]["query"]["n"], 10);
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn send_assigns_increasing_xs_after_login() {
        let sync = Arc::new(AtomicBool::new(false));
        let (handle, mut events, mut sent) = start(true, SocketMode::Competition { sync });
        let (_, login) = sent.recv().await.unwrap();
        assert_eq!(login["xs"], 1);
        assert!(matches!(events.recv().await, Some(SocketEvent::Online(_))));

        let a = handle.send(Resource::Events, Payload::Query(json!({"n": 1}))).unwrap();
        let b = handle.sync().unwrap();
        assert_eq!((a, b), (2, 3));
        let (_, first) = sent.recv().await.unwrap();
        let (_, second) = sent.recv().await.unwrap();
        assert_eq!(first["xs"], 2);
        assert_eq!(resource(&first), "/eventBlocks/event/data");
        assert_eq!(second["xs"], 3);
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_login_reports_unauthorized_and_retries() {
        let (handle, mut events, mut sent) = start(false, SocketMode::Ticket);
        let (conn, _) = sent.recv().await.unwrap();
        assert_eq!(conn, 1);
        assert!(matches!(events.recv().await, Some(SocketEvent::Unauthorized(_))));
        assert!(matches!(events.recv().await, Some(SocketEvent::Lost)));
        assert!(!handle.is_authorized());

        let started = Instant::now();
        let (conn, _) = sent.recv().await.unwrap();
        assert_eq!(conn, 2);
        assert!(started.elapsed() >= LOGIN_RETRY_TIMEOUT);
        handle.close();
    }
}
