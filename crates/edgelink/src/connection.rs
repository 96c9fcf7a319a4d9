use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use edgelink_object::buffer::SliceWriter;
use edgelink_object::{Arena, Error, Kv, Result, Value, json};
use edgelink_wire as wire;
use edgelink_wire::{Header, HeaderValue, MessageFlags, MessageType};
use tracing::{debug, error, trace, warn};

use crate::remote::{RemoteError, parse_error_payload};
use crate::socket;
use crate::streams::{Delivery, StreamEvents, StreamTable, SubscriptionHandle};

/// Maximum on-wire frame size; bounds both scratch buffers.
pub const MAX_MSG_LEN: usize = 10_000;

/// Deadline for a unary reply or a subscription-open acknowledgment.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable naming the runtime's IPC socket path.
pub const ENV_SOCKET_PATH: &str = "AWS_GG_NUCLEUS_DOMAIN_SOCKET_FILEPATH_FOR_COMPONENT";
/// Environment variable carrying the component's auth token.
pub const ENV_AUTH_TOKEN: &str = "SVCUID";

const PROTOCOL_VERSION: &[u8] = b"0.1.0";
const CONNECT_STREAM_ID: i32 = 0;
const UNARY_STREAM_ID: i32 = 1;
const FIRST_SUBSCRIPTION_STREAM_ID: i32 = 2;

/// How the client identifies itself during the handshake.
#[derive(Debug, Clone, Copy)]
pub enum Identity<'a> {
    /// Connect as a named component; the server assigns an auth token
    /// (`svcuid`) in its acknowledgment.
    ComponentName(&'a str),
    /// Connect with a pre-issued auth token.
    AuthToken(&'a str),
}

struct Reply {
    message_type: i32,
    payload: Vec<u8>,
}

#[derive(Default)]
struct UnaryCall {
    /// True while a caller is parked on the rendezvous. A reply arriving
    /// with no waiter (a late reply to a timed-out call) is dropped.
    waiting: bool,
    reply: Option<Reply>,
}

struct Shared {
    stream: UnixStream,
    svcuid: Option<String>,
    connected: AtomicBool,
    /// Single send scratch. Held across JSON-encode and socket write for
    /// frame atomicity, and across the unary rendezvous so only one unary
    /// call is ever outstanding.
    send: Mutex<Box<[u8]>>,
    unary: Mutex<UnaryCall>,
    unary_signal: Condvar,
    streams: StreamTable,
    next_stream_id: AtomicI32,
}

/// A single multiplexed IPC connection: one in-flight unary call on stream 1
/// and any number of subscriptions on streams ≥ 2, fed by a dedicated reader
/// thread.
///
/// Cloning is cheap and shares the connection.
///
/// Subscription callbacks run on the reader thread. A callback must not make
/// a blocking call on the same connection (the reply could only be read by
/// the thread that is busy in the callback); closing its own subscription is
/// fine.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Connects using the `AWS_GG_NUCLEUS_DOMAIN_SOCKET_FILEPATH_FOR_COMPONENT`
    /// and `SVCUID` environment variables.
    pub fn connect() -> Result<Self> {
        let path = std::env::var_os(ENV_SOCKET_PATH).ok_or(Error::Config)?;
        let token = std::env::var(ENV_AUTH_TOKEN).map_err(|_| Error::Config)?;
        Self::connect_with_token(Path::new(&path), &token)
    }

    /// Connects to `path` with a pre-issued auth token.
    pub fn connect_with_token(path: &Path, auth_token: &str) -> Result<Self> {
        let stream = socket::connect(path)?;
        Self::establish(stream, Identity::AuthToken(auth_token))
    }

    /// Connects to `path` as `component_name`. The server-assigned token is
    /// available via [`Connection::svcuid`].
    pub fn connect_with_name(path: &Path, component_name: &str) -> Result<Self> {
        let stream = socket::connect(path)?;
        Self::establish(stream, Identity::ComponentName(component_name))
    }

    /// Performs the handshake over an already-connected socket and starts
    /// the reader thread. This is the injection point for tests driving a
    /// socketpair.
    pub fn establish(stream: UnixStream, identity: Identity<'_>) -> Result<Self> {
        let svcuid = handshake(&stream, identity)?;

        let reader_stream = stream.try_clone().map_err(|err| {
            error!(%err, "couldn't clone socket for reader");
            Error::Failure
        })?;

        let shared = Arc::new(Shared {
            stream,
            svcuid,
            connected: AtomicBool::new(true),
            send: Mutex::new(vec![0u8; MAX_MSG_LEN].into_boxed_slice()),
            unary: Mutex::new(UnaryCall::default()),
            unary_signal: Condvar::new(),
            streams: StreamTable::new(),
            next_stream_id: AtomicI32::new(FIRST_SUBSCRIPTION_STREAM_ID),
        });

        let reader_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("edgelink-reader".into())
            .spawn(move || reader_loop(&reader_shared, &reader_stream))
            .map_err(|err| {
                error!(%err, "couldn't spawn reader thread");
                Error::Failure
            })?;

        Ok(Self { shared })
    }

    /// Auth token assigned by the server during a by-name handshake.
    pub fn svcuid(&self) -> Option<&str> {
        self.shared.svcuid.as_deref()
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Pid of the server process on the other end of the socket.
    pub fn peer_pid(&self) -> Result<i32> {
        socket::peer_pid(&self.shared.stream)
    }

    /// Tears the connection down. The reader thread exits, waiting calls
    /// fail with `NoConn`, and all subscriptions are dropped.
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Release);
        let _ = self.shared.stream.shutdown(std::net::Shutdown::Both);
    }

    /// True while `handle` names a live subscription.
    pub fn subscription_valid(&self, handle: SubscriptionHandle) -> bool {
        self.shared.streams.protected(handle, |_| ()).is_ok()
    }

    /// Issues a unary request and decodes the reply payload into `alloc`.
    ///
    /// An empty reply payload decodes as [`Value::Null`]. On a server-side
    /// error the call returns [`Error::Remote`] and fills `remote_err` (when
    /// provided) with the decoded code and message.
    pub fn call<'m>(
        &self,
        operation: &str,
        service_model_type: &str,
        params: &[Kv<'_>],
        alloc: &mut Arena<'m>,
        remote_err: Option<&mut RemoteError>,
    ) -> Result<Value<'m>> {
        let mut payload = self.call_raw(operation, service_model_type, params, remote_err)?;
        if payload.is_empty() {
            return Ok(Value::Null);
        }
        let value = json::decode_destructive(&mut payload).map_err(|err| {
            error!(operation, %err, "couldn't decode reply payload");
            err
        })?;
        value.claim(alloc)
    }

    /// Issues a unary request, discarding any reply payload.
    pub fn call_no_reply(
        &self,
        operation: &str,
        service_model_type: &str,
        params: &[Kv<'_>],
        remote_err: Option<&mut RemoteError>,
    ) -> Result<()> {
        self.call_raw(operation, service_model_type, params, remote_err).map(drop)
    }

    /// Unary request returning the raw reply payload bytes.
    pub(crate) fn call_raw(
        &self,
        operation: &str,
        service_model_type: &str,
        params: &[Kv<'_>],
        remote_err: Option<&mut RemoteError>,
    ) -> Result<Vec<u8>> {
        if !self.connected() {
            return Err(Error::NoConn);
        }

        let headers = [
            Header::i32(wire::HEADER_MESSAGE_TYPE, MessageType::ApplicationMessage.as_i32()),
            Header::i32(wire::HEADER_MESSAGE_FLAGS, 0),
            Header::i32(wire::HEADER_STREAM_ID, UNARY_STREAM_ID),
            Header::string(wire::HEADER_OPERATION, operation.as_bytes()),
            Header::string(wire::HEADER_SERVICE_MODEL_TYPE, service_model_type.as_bytes()),
        ];

        // The scratch lock is held through the rendezvous: stream 1 carries
        // at most one call at a time.
        let mut scratch = self.lock_send();
        let len = wire::encode(&mut scratch[..], &headers, |w| json::encode_map(params, w))?;

        {
            let mut unary = self.lock_unary();
            unary.waiting = true;
            unary.reply = None;
        }

        if let Err(err) = socket::write_all(&self.shared.stream, &scratch[..len]) {
            self.lock_unary().waiting = false;
            self.shared.connected.store(false, Ordering::Release);
            return Err(err);
        }
        trace!(operation, len, "request sent");

        let reply = self.wait_reply()?;
        match MessageType::try_from(reply.message_type) {
            Ok(MessageType::ApplicationMessage) => Ok(reply.payload),
            Ok(MessageType::ApplicationError) => {
                warn!(operation, "received an error reply");
                let mut payload = reply.payload;
                match parse_error_payload(&mut payload) {
                    Ok(parsed) => {
                        debug!(operation, code = ?parsed.code, message = %parsed.message, "remote error");
                        if let Some(sink) = remote_err {
                            *sink = parsed;
                        }
                        Err(Error::Remote)
                    }
                    Err(err) => {
                        error!(operation, %err, "couldn't decode error payload");
                        Err(err)
                    }
                }
            }
            _ => {
                error!(operation, message_type = reply.message_type, "unexpected reply type");
                Err(Error::Failure)
            }
        }
    }

    fn wait_reply(&self) -> Result<Reply> {
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        let mut unary = self.lock_unary();
        loop {
            if let Some(reply) = unary.reply.take() {
                unary.waiting = false;
                return Ok(reply);
            }
            if !self.connected() {
                unary.waiting = false;
                return Err(Error::NoConn);
            }

            let now = Instant::now();
            if now >= deadline {
                // Stream 1 stays implicitly reserved; the late reply is
                // dropped by the reader when it finds no waiter.
                unary.waiting = false;
                warn!("timed out waiting for reply");
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .shared
                .unary_signal
                .wait_timeout(unary, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            unary = guard;
        }
    }

    /// Opens a subscription: registers a stream-table slot, sends the
    /// subscribe request on a fresh stream id, and waits for the server's
    /// acknowledgment.
    pub(crate) fn open_subscription(
        &self,
        operation: &str,
        service_model_type: &str,
        params: &[Kv<'_>],
        events: Box<dyn StreamEvents>,
        remote_err: Option<&mut RemoteError>,
    ) -> Result<SubscriptionHandle> {
        if !self.connected() {
            return Err(Error::NoConn);
        }

        let stream_id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let handle = self.shared.streams.register(stream_id, events)?;

        let headers = [
            Header::i32(wire::HEADER_MESSAGE_TYPE, MessageType::ApplicationMessage.as_i32()),
            Header::i32(wire::HEADER_MESSAGE_FLAGS, 0),
            Header::i32(wire::HEADER_STREAM_ID, stream_id),
            Header::string(wire::HEADER_OPERATION, operation.as_bytes()),
            Header::string(wire::HEADER_SERVICE_MODEL_TYPE, service_model_type.as_bytes()),
        ];

        {
            let mut scratch = self.lock_send();
            let len = match wire::encode(&mut scratch[..], &headers, |w| json::encode_map(params, w)) {
                Ok(len) => len,
                Err(err) => {
                    let _ = self.shared.streams.release(handle);
                    return Err(err);
                }
            };
            if let Err(err) = socket::write_all(&self.shared.stream, &scratch[..len]) {
                let _ = self.shared.streams.release(handle);
                self.shared.connected.store(false, Ordering::Release);
                return Err(err);
            }
        }

        let ack = match self.shared.streams.wait_ack(handle, RESPONSE_TIMEOUT) {
            Ok(ack) => ack,
            Err(Error::NoEntry) if !self.connected() => return Err(Error::NoConn),
            Err(err) => return Err(err),
        };

        if ack.error {
            let _ = self.shared.streams.release(handle);
            let mut payload = ack.payload;
            let parsed = parse_error_payload(&mut payload)?;
            warn!(operation, code = ?parsed.code, "subscribe rejected");
            if let Some(sink) = remote_err {
                *sink = parsed;
            }
            return Err(Error::Remote);
        }

        self.shared.streams.activate(handle)?;
        debug!(operation, stream_id, handle = handle.raw(), "subscription established");
        Ok(handle)
    }

    /// Closes a subscription: invalidates the handle (blocking out any
    /// in-flight callback on another thread first) and notifies the server.
    ///
    /// Safe to call from within the subscription's own callback. Fails with
    /// `NoEntry` if the handle is stale.
    pub fn close_subscription(&self, handle: SubscriptionHandle) -> Result<()> {
        let stream_id = self.shared.streams.release(handle)?;

        if self.connected() {
            let headers = [
                Header::i32(wire::HEADER_MESSAGE_TYPE, MessageType::ApplicationMessage.as_i32()),
                Header::i32(wire::HEADER_MESSAGE_FLAGS, MessageFlags::TERMINATE_STREAM.bits()),
                Header::i32(wire::HEADER_STREAM_ID, stream_id),
            ];
            let mut scratch = self.lock_send();
            match wire::encode(&mut scratch[..], &headers, |_: &mut SliceWriter<'_>| Ok(())) {
                Ok(len) => {
                    if let Err(err) = socket::write_all(&self.shared.stream, &scratch[..len]) {
                        debug!(stream_id, %err, "couldn't send terminate-stream notice");
                    }
                }
                Err(err) => debug!(stream_id, %err, "couldn't encode terminate-stream notice"),
            }
        }

        Ok(())
    }

    fn lock_send(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.shared.send.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_unary(&self) -> MutexGuard<'_, UnaryCall> {
        self.shared.unary.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// CONNECT / CONNECT_ACK exchange, run synchronously on the connecting
/// thread before the reader exists.
fn handshake(stream: &UnixStream, identity: Identity<'_>) -> Result<Option<String>> {
    let headers = [
        Header::i32(wire::HEADER_MESSAGE_TYPE, MessageType::Connect.as_i32()),
        Header::i32(wire::HEADER_MESSAGE_FLAGS, 0),
        Header::i32(wire::HEADER_STREAM_ID, CONNECT_STREAM_ID),
        Header::string(wire::HEADER_VERSION, PROTOCOL_VERSION),
    ];
    let payload = match identity {
        Identity::ComponentName(name) => [Kv::new(b"componentName", Value::Buf(name.as_bytes()))],
        Identity::AuthToken(token) => [Kv::new(b"authToken", Value::Buf(token.as_bytes()))],
    };

    let mut scratch = vec![0u8; MAX_MSG_LEN];
    let len = wire::encode(&mut scratch, &headers, |w| json::encode_map(&payload, w))?;
    socket::write_all(stream, &scratch[..len])?;

    let mut prelude_buf = [0u8; wire::PRELUDE_LEN];
    socket::read_exact(stream, &mut prelude_buf)?;
    let prelude = wire::decode_prelude(&prelude_buf)?;
    if prelude.data_len() > scratch.len() {
        error!(len = prelude.total_len(), "handshake reply exceeds receive buffer");
        return Err(Error::NoMem);
    }
    let data = &mut scratch[..prelude.data_len()];
    socket::read_exact(stream, data)?;
    let msg = wire::decode(&prelude, data)?;
    let common = wire::common_headers(&msg)?;

    if common.message_type != MessageType::ConnectAck.as_i32() {
        error!(message_type = common.message_type, "connection response not an ack");
        return Err(Error::Failure);
    }
    if !common.message_flags.contains(MessageFlags::CONNECTION_ACCEPTED) {
        error!("connection response missing accepted flag");
        return Err(Error::Failure);
    }
    if !msg.payload.is_empty() {
        warn!("connection ack has unexpected payload; ignoring");
    }

    let svcuid = msg.headers().find(|h| h.name == wire::HEADER_SVCUID);
    match identity {
        Identity::AuthToken(_) => Ok(None),
        Identity::ComponentName(_) => match svcuid {
            Some(Header { value: HeaderValue::Str(token), .. }) => {
                Ok(Some(String::from_utf8_lossy(token).into_owned()))
            }
            Some(_) => {
                error!("svcuid header is not a string");
                Err(Error::Invalid)
            }
            None => {
                error!("connection ack missing svcuid header");
                Err(Error::Failure)
            }
        },
    }
}

/// Background reader: decodes frames off the socket and routes them by
/// stream id until the transport dies.
fn reader_loop(shared: &Arc<Shared>, stream: &UnixStream) {
    let mut scratch = vec![0u8; MAX_MSG_LEN].into_boxed_slice();

    loop {
        let mut prelude_buf = [0u8; wire::PRELUDE_LEN];
        if let Err(err) = socket::read_exact(stream, &mut prelude_buf) {
            debug!(%err, "reader: transport closed");
            break;
        }
        let prelude = match wire::decode_prelude(&prelude_buf) {
            Ok(prelude) => prelude,
            Err(err) => {
                error!(%err, "reader: bad frame prelude");
                break;
            }
        };
        if prelude.data_len() > scratch.len() {
            error!(len = prelude.total_len(), "reader: frame exceeds receive buffer");
            break;
        }

        let data = &mut scratch[..prelude.data_len()];
        if let Err(err) = socket::read_exact(stream, data) {
            debug!(%err, "reader: transport closed mid-frame");
            break;
        }
        let msg = match wire::decode(&prelude, data) {
            Ok(msg) => msg,
            Err(err) => {
                error!(%err, "reader: frame failed validation");
                break;
            }
        };
        let common = match wire::common_headers(&msg) {
            Ok(common) => common,
            Err(err) => {
                error!(%err, "reader: frame missing routing headers");
                break;
            }
        };

        dispatch(shared, common, msg.payload);
    }

    shared.connected.store(false, Ordering::Release);
    {
        // Fail any caller parked on the unary rendezvous.
        let _unary = shared.unary.lock().unwrap_or_else(PoisonError::into_inner);
        shared.unary_signal.notify_all();
    }
    shared.streams.release_all();
    debug!("reader exited; connection is down");
}

fn dispatch(shared: &Arc<Shared>, common: wire::CommonHeaders, payload: &[u8]) {
    trace!(
        stream_id = common.stream_id,
        message_type = common.message_type,
        len = payload.len(),
        "frame received"
    );

    match common.stream_id {
        UNARY_STREAM_ID => {
            let mut unary = shared.unary.lock().unwrap_or_else(PoisonError::into_inner);
            if unary.waiting && unary.reply.is_none() {
                unary.reply =
                    Some(Reply { message_type: common.message_type, payload: payload.to_vec() });
                shared.unary_signal.notify_all();
            } else {
                debug!("dropping reply with no waiter");
            }
        }
        CONNECT_STREAM_ID => {
            debug!(message_type = common.message_type, "dropping control frame");
        }
        stream_id => {
            let delivery = if common.message_type == MessageType::ApplicationMessage.as_i32() {
                Delivery::Event {
                    payload,
                    terminate: common.message_flags.contains(MessageFlags::TERMINATE_STREAM),
                }
            } else {
                Delivery::Error { payload }
            };
            shared.streams.deliver(stream_id, delivery);
        }
    }
}
