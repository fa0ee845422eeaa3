use std::{
    io::{self, Read, Write},
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
};

use bolt_codec::{ByteBuffer, Encoder, Reader, Value, ValuePool, decode_value, frame};
use tracing::{debug, warn};

use crate::{
    auth::Auth,
    config::DriverConfig,
    message,
    status::{Action, Code, Domain, Status},
};

/// Handshake magic preceding the version proposals.
pub const HANDSHAKE_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Manifest-style negotiation marker sent as the first proposal.
const MANIFEST_V1: u32 = 0x0000_01FF;

/// Bytes requested from the kernel per receive.
const RECV_CHUNK: usize = 64 * 1024;

/// Protocol version as negotiated: a major.minor pair carried in the low two
/// bytes of the 32-bit handshake word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    fn from_word(word: u32) -> Self {
        Self { major: (word & 0xFF) as u8, minor: ((word >> 8) & 0xFF) as u8 }
    }

    /// Big-endian proposal/echo form: `00 00 mm MM`.
    fn to_bytes(self) -> [u8; 4] {
        [0, 0, self.minor, self.major]
    }

    fn is_supported(self) -> bool {
        (2..=6).contains(&self.major)
    }

    /// v5 onwards splits authentication out of HELLO into LOGON.
    pub fn supports_logon(self) -> bool {
        self.major >= 5
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Per-connection protocol state. Stored in a shared atomic: the decoder side
/// drives every transition on replies, the encoder side only observes (and
/// claims `Run` when pipelining queries).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoltState {
    Disconnected = 0,
    Connecting = 1,
    Logon = 2,
    Ready = 3,
    Run = 4,
    Pull = 5,
    Streaming = 6,
    Error = 7,
}

impl BoltState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => BoltState::Connecting,
            2 => BoltState::Logon,
            3 => BoltState::Ready,
            4 => BoltState::Run,
            5 => BoltState::Pull,
            6 => BoltState::Streaming,
            7 => BoltState::Error,
            _ => BoltState::Disconnected,
        }
    }
}

/// How a completed command ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// PULL/DISCARD summary; `has_more` continues the stream on a later PULL.
    Summary { has_more: bool },
    /// SUCCESS ack for a control message (BEGIN, COMMIT, RESET, ...).
    Ack,
    /// The server skipped this command because of an earlier failure.
    Ignored,
    /// Server FAILURE.
    Failed,
}

/// Where the decoder thread delivers protocol events. Runs on that thread;
/// implementations must not block.
pub trait ReplySink {
    /// One RECORD message. `payload` is the encoded struct body and is valid
    /// only for the duration of the call.
    fn on_record(&mut self, payload: &[u8]);

    /// A command reached a terminal reply. `payload` as above.
    fn on_complete(&mut self, outcome: Outcome, payload: &[u8], status: Status);
}

/// Sink for phases where no events can arrive (handshake, tests).
pub(crate) struct DiscardSink;

impl ReplySink for DiscardSink {
    fn on_record(&mut self, _payload: &[u8]) {}
    fn on_complete(&mut self, _outcome: Outcome, _payload: &[u8], _status: Status) {}
}

/// Outcome of dispatching one reply; owned so buffer borrows end before the
/// reader mutates itself.
struct Reply {
    status: Status,
    new_state: Option<BoltState>,
    error: Option<String>,
    fields: Option<Vec<String>>,
    /// This reply answered one outstanding RUN (its metadata or failure).
    run_done: bool,
    /// RESET ack: whatever was queued server-side is gone.
    clear_runs: bool,
}

impl Reply {
    fn ok() -> Self {
        Self {
            status: Status::OK,
            new_state: None,
            error: None,
            fields: None,
            run_done: false,
            clear_runs: false,
        }
    }

    fn with_state(state: BoltState) -> Self {
        Self { new_state: Some(state), ..Self::ok() }
    }
}

/// The write half: sole owner of the send buffer and the socket send path.
pub struct WireWriter {
    stream: TcpStream,
    buf: ByteBuffer,
    pool: ValuePool,
    state: Arc<AtomicU8>,
    /// RUNs sent whose field-metadata reply has not arrived yet. Keeps the
    /// state machine in `Run` across pipelined queries.
    pending_runs: Arc<AtomicU32>,
    config: Arc<DriverConfig>,
    pub(crate) version: Version,
    tx_depth: u32,
}

/// The read half: sole owner of the receive buffer, the socket receive path
/// and every state transition.
pub struct WireReader {
    stream: TcpStream,
    buf: ByteBuffer,
    state: Arc<AtomicU8>,
    pending_runs: Arc<AtomicU32>,
    pub(crate) version: Version,
    handshaking: bool,
    last_error: String,
    fields: Vec<String>,
}

/// One socket plus both halves, as created by [`Connection::open`] and driven
/// through the handshake by [`Connection::start`]. `split` hands the halves
/// to the cell's worker threads.
pub struct Connection {
    pub(crate) writer: WireWriter,
    pub(crate) reader: WireReader,
}

impl Connection {
    /// TCP-connect and prepare both halves. No protocol bytes flow yet.
    pub fn open(config: Arc<DriverConfig>, client_id: u64) -> Result<Self, Status> {
        let stream = TcpStream::connect(&config.address).map_err(|e| {
            debug!(addr = %config.address, %client_id, ?e, "connect failed");
            Status::io(Action::Retry, Code::ServerConnect, &e)
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| Status::io(Action::Fail, Code::ServerConnect, &e))?;
        if let Some(size) = config.socket_buf_size {
            set_socket_buf_size(&stream, size);
        }
        let read_stream = stream
            .try_clone()
            .map_err(|e| Status::io(Action::Fail, Code::ServerConnect, &e))?;

        let state = Arc::new(AtomicU8::new(BoltState::Disconnected as u8));
        let pending_runs = Arc::new(AtomicU32::new(0));
        Ok(Self {
            writer: WireWriter {
                stream,
                buf: ByteBuffer::new(),
                pool: ValuePool::new(),
                state: state.clone(),
                pending_runs: pending_runs.clone(),
                config,
                version: Version::default(),
                tx_depth: 0,
            },
            reader: WireReader {
                stream: read_stream,
                buf: ByteBuffer::new(),
                state,
                pending_runs,
                version: Version::default(),
                handshaking: false,
                last_error: String::new(),
                fields: Vec::new(),
            },
        })
    }

    /// Negotiate a version, authenticate, and land in `Ready`.
    pub fn start(&mut self) -> Status {
        self.writer.set_state(BoltState::Connecting);

        let version = match self.writer.negotiate_version() {
            Ok(v) => v,
            Err(status) => {
                self.close();
                return status;
            }
        };
        debug!(%version, "negotiated");
        self.writer.version = version;
        self.reader.version = version;

        self.reader.handshaking = true;
        let mut sink = DiscardSink;
        let mut status = self.writer.send_hello();
        while status.is_ok() {
            match self.state() {
                BoltState::Ready => break,
                BoltState::Logon => {
                    // HELLO was acknowledged; credentials go in LOGON.
                    status = self.writer.send_logon();
                    if !status.is_ok() {
                        break;
                    }
                    status = self.reader.recv_message(&mut sink);
                }
                _ => status = self.reader.recv_message(&mut sink),
            }
        }
        self.reader.handshaking = false;

        if !status.is_ok() {
            self.close();
            return status;
        }
        Status::OK
    }

    #[inline]
    pub fn state(&self) -> BoltState {
        self.reader.state()
    }

    /// Shared state cell, observed by cells for `is_connected`.
    pub fn state_handle(&self) -> Arc<AtomicU8> {
        self.writer.state.clone()
    }

    /// An extra handle onto the socket, used to shut it down from a third
    /// thread and unblock the reader.
    pub fn control_handle(&self) -> io::Result<TcpStream> {
        self.writer.stream.try_clone()
    }

    pub fn last_error(&self) -> &str {
        &self.reader.last_error
    }

    pub fn split(self) -> (WireWriter, WireReader) {
        (self.writer, self.reader)
    }

    fn close(&mut self) {
        self.writer.set_state(BoltState::Disconnected);
        let _ = self.writer.stream.shutdown(std::net::Shutdown::Both);
        self.writer.buf.reset();
        self.reader.buf.reset();
    }
}

impl WireWriter {
    #[inline]
    pub fn state(&self) -> BoltState {
        BoltState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, s: BoltState) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Send the magic and four proposals (manifest first), read the server's
    /// choice, and echo the pick when the server answered with a manifest.
    fn negotiate_version(&mut self) -> Result<Version, Status> {
        let mut proposal = [0u8; 20];
        proposal[..4].copy_from_slice(&HANDSHAKE_MAGIC);
        proposal[4..8].copy_from_slice(&MANIFEST_V1.to_be_bytes());
        proposal[8..12].copy_from_slice(&Version::new(4, 4).to_bytes());
        proposal[12..16].copy_from_slice(&Version::new(3, 0).to_bytes());
        proposal[16..20].copy_from_slice(&Version::new(2, 0).to_bytes());

        self.stream
            .write_all(&proposal)
            .map_err(|e| Status::io(Action::Retry, Code::Version, &e))?;

        let mut word = [0u8; 4];
        self.stream
            .read_exact(&mut word)
            .map_err(|e| Status::io(Action::Retry, Code::Version, &e))?;
        let chosen = u32::from_be_bytes(word);

        if chosen == 0 {
            return Err(Status::new(Action::Fail, Domain::WireProto, Code::Version, 0));
        }

        if chosen != MANIFEST_V1 {
            let version = Version::from_word(chosen);
            if !version.is_supported() {
                return Err(Status::new(
                    Action::Fail,
                    Domain::WireProto,
                    Code::Version,
                    chosen,
                ));
            }
            return Ok(version);
        }

        // Manifest: a count byte, then that many 32-bit versions. Pick the
        // highest we support and echo it, padded with a trailing zero.
        let mut count = [0u8; 1];
        self.stream
            .read_exact(&mut count)
            .map_err(|e| Status::io(Action::Retry, Code::Version, &e))?;

        let mut best: Option<Version> = None;
        for _ in 0..count[0] {
            self.stream
                .read_exact(&mut word)
                .map_err(|e| Status::io(Action::Retry, Code::Version, &e))?;
            let offered = Version::from_word(u32::from_be_bytes(word));
            if offered.is_supported() && best.is_none_or(|b| offered > b) {
                best = Some(offered);
            }
        }

        let Some(version) = best else {
            return Err(Status::new(Action::Fail, Domain::WireProto, Code::Version, 0));
        };

        let mut echo = [0u8; 5];
        echo[..4].copy_from_slice(&version.to_bytes());
        self.stream
            .write_all(&echo)
            .map_err(|e| Status::io(Action::Retry, Code::Version, &e))?;

        Ok(version)
    }

    /// v5+: HELLO carries agent metadata only; credentials follow in LOGON.
    /// v4 and below: a single HELLO with credentials inline.
    pub fn send_hello(&mut self) -> Status {
        let config = self.config.clone();
        if self.version.supports_logon() {
            let agent_keys =
                [Value::String("product"), Value::String("platform"), Value::String("language")];
            let agent_vals = [
                Value::String(concat!("boltdrive/", env!("CARGO_PKG_VERSION"))),
                Value::String(std::env::consts::OS),
                Value::String("Rust/2024"),
            ];
            let keys = [Value::String("user_agent"), Value::String("bolt_agent")];
            let vals =
                [Value::String(&config.user_agent), Value::map(&agent_keys, &agent_vals)];
            let fields = [Value::map(&keys, &vals)];
            let body = Value::structure(message::HELLO, &fields);
            Encoder::new(&mut self.buf).message(&body);
        } else {
            // user_agent + scheme-dependent entries: count varies, build in
            // the pool.
            let count = 1 + config.auth.entry_count();
            let keys = self.pool.alloc(count);
            let vals = self.pool.alloc(count);
            unsafe {
                self.pool.put(keys, 0, Value::String("user_agent"));
                self.pool.put(vals, 0, Value::String(&config.user_agent));
            }
            fill_auth(&mut self.pool, keys, vals, 1, &config.auth);

            let fields = [Value::map(self.pool.get(keys), self.pool.get(vals))];
            let body = Value::structure(message::HELLO, &fields);
            Encoder::new(&mut self.buf).message(&body);

            self.pool.release(count);
            self.pool.release(count);
        }
        self.flush()
    }

    pub fn send_logon(&mut self) -> Status {
        let config = self.config.clone();
        let count = config.auth.entry_count();
        let keys = self.pool.alloc(count);
        let vals = self.pool.alloc(count);
        fill_auth(&mut self.pool, keys, vals, 0, &config.auth);

        let fields = [Value::map(self.pool.get(keys), self.pool.get(vals))];
        let body = Value::structure(message::LOGON, &fields);
        Encoder::new(&mut self.buf).message(&body);

        self.pool.release(count);
        self.pool.release(count);
        self.flush()
    }

    /// Encode RUN and immediately pipeline a PULL behind it. Valid from
    /// `Ready` (fresh query) or `Run` (pipelining).
    ///
    /// `params` and `extras` are pre-packed map values.
    pub fn run(&mut self, cypher: &str, params: &[u8], extras: &[u8], n: i64) -> Status {
        let state = self.state();
        if state != BoltState::Ready && state != BoltState::Run {
            return Status::new(Action::Fail, Domain::InternalState, Code::ServerQuery, state as u32);
        }
        self.set_state(BoltState::Run);
        self.pending_runs.fetch_add(1, Ordering::AcqRel);

        let mut enc = Encoder::new(&mut self.buf);
        enc.message_with(|e| {
            e.struct_header(message::RUN, 3);
            e.value(&Value::String(cypher));
            e.packed(params);
            e.packed(extras);
        });
        Self::encode_pull(&mut enc, n);
        self.flush()
    }

    /// A bare PULL, for resuming a `has_more` stream.
    pub fn pull(&mut self, n: i64) -> Status {
        if self.state() == BoltState::Disconnected {
            return Status::new(Action::Fail, Domain::InternalState, Code::ServerQuery, 0);
        }
        let mut enc = Encoder::new(&mut self.buf);
        Self::encode_pull(&mut enc, n);
        self.flush()
    }

    /// Throw away the rest of the current stream.
    pub fn discard(&mut self, n: i64) -> Status {
        let state = self.state();
        if state != BoltState::Streaming && state != BoltState::Pull {
            return Status::OK; // nothing to discard
        }
        let keys = [Value::String("n"), Value::String("qid")];
        let vals = [Value::Int(n), Value::Int(-1)];
        let fields = [Value::map(&keys, &vals)];
        Encoder::new(&mut self.buf).message(&Value::structure(message::DISCARD, &fields));
        self.flush()
    }

    /// BEGIN goes on the wire only when the transaction depth rises 0 -> 1.
    /// Returns whether bytes were sent.
    pub fn begin(&mut self, options: &[u8]) -> (Status, bool) {
        if self.tx_depth > 0 {
            self.tx_depth += 1;
            return (Status::OK, false);
        }
        self.tx_depth = 1;
        let mut enc = Encoder::new(&mut self.buf);
        enc.message_with(|e| {
            e.struct_header(message::BEGIN, 1);
            e.packed(options);
        });
        (self.flush(), true)
    }

    /// COMMIT goes on the wire only when the depth falls 1 -> 0.
    pub fn commit(&mut self) -> (Status, bool) {
        if self.tx_depth != 1 {
            self.tx_depth = self.tx_depth.saturating_sub(1);
            return (Status::OK, false);
        }
        self.tx_depth = 0;
        Encoder::new(&mut self.buf).message(&Value::structure(message::COMMIT, &[]));
        (self.flush(), true)
    }

    pub fn rollback(&mut self) -> (Status, bool) {
        if self.tx_depth != 1 {
            self.tx_depth = self.tx_depth.saturating_sub(1);
            return (Status::OK, false);
        }
        self.tx_depth = 0;
        Encoder::new(&mut self.buf).message(&Value::structure(message::ROLLBACK, &[]));
        (self.flush(), true)
    }

    /// RESET clears server-side state and recovers from `Error`.
    pub fn reset(&mut self) -> Status {
        if self.state() == BoltState::Disconnected {
            return Status::new(Action::Fail, Domain::InternalState, Code::None, 0);
        }
        Encoder::new(&mut self.buf).message(&Value::structure(message::RESET, &[]));
        self.flush()
    }

    /// Legacy failure acknowledgement; only meaningful from `Error`.
    pub fn ack_failure(&mut self) -> (Status, bool) {
        if self.state() != BoltState::Error {
            return (Status::OK, false);
        }
        Encoder::new(&mut self.buf).message(&Value::structure(message::ACK_FAILURE, &[]));
        (self.flush(), true)
    }

    /// Driver-usage telemetry; ignored outside `Ready`.
    pub fn telemetry(&mut self, api: i64) -> (Status, bool) {
        if self.state() != BoltState::Ready {
            return (Status::OK, false);
        }
        let fields = [Value::Int(api)];
        Encoder::new(&mut self.buf).message(&Value::structure(message::TELEMETRY, &fields));
        (self.flush(), true)
    }

    /// Drop authentication but keep the connection (v5.1+).
    pub fn logoff(&mut self) -> Status {
        if self.state() == BoltState::Disconnected || !self.version.supports_logon() {
            return Status::OK;
        }
        self.set_state(BoltState::Connecting);
        Encoder::new(&mut self.buf).message(&Value::structure(message::LOGOFF, &[]));
        self.flush()
    }

    /// Say goodbye and close. No reply is expected.
    pub fn goodbye(&mut self) -> Status {
        if self.state() == BoltState::Disconnected {
            return Status::OK;
        }
        Encoder::new(&mut self.buf).message(&Value::structure(message::GOODBYE, &[]));
        let status = self.flush();
        self.set_state(BoltState::Disconnected);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        status
    }

    /// Push the whole write buffer into the kernel.
    fn flush(&mut self) -> Status {
        while !self.buf.is_empty() {
            match self.stream.write(self.buf.readable()) {
                Ok(0) => {
                    warn!("wire: zero-length send, peer gone");
                    self.set_state(BoltState::Disconnected);
                    return Status::new(Action::Retry, Domain::Syscall, Code::None, 0);
                }
                Ok(n) => self.buf.consume(n),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => {
                    warn!(?e, "wire: send failed");
                    self.set_state(BoltState::Disconnected);
                    return Status::io(Action::Retry, Code::None, &e);
                }
            }
        }
        self.buf.reset();
        Status::OK
    }

    fn encode_pull(enc: &mut Encoder<'_>, n: i64) {
        let keys = [Value::String("n"), Value::String("qid")];
        let vals = [Value::Int(n), Value::Int(-1)];
        let fields = [Value::map(&keys, &vals)];
        enc.message(&Value::structure(message::PULL, &fields));
    }
}

/// Write `scheme` plus the scheme-specific entries into `keys`/`vals`
/// starting at `at`.
fn fill_auth(pool: &mut ValuePool, keys: bolt_codec::PoolSlice, vals: bolt_codec::PoolSlice, at: usize, auth: &Auth) {
    // Safety: the auth borrow outlives the pool runs, which are released
    // before send_hello/send_logon return.
    unsafe {
        pool.put(keys, at, Value::String("scheme"));
        pool.put(vals, at, Value::String(auth.scheme()));
        match auth {
            Auth::None => {}
            Auth::Basic { principal, credentials } => {
                pool.put(keys, at + 1, Value::String("principal"));
                pool.put(vals, at + 1, Value::String(principal));
                pool.put(keys, at + 2, Value::String("credentials"));
                pool.put(vals, at + 2, Value::String(credentials));
            }
            Auth::Bearer { credentials } | Auth::Kerberos { credentials } => {
                pool.put(keys, at + 1, Value::String("credentials"));
                pool.put(vals, at + 1, Value::String(credentials));
            }
        }
    }
}

impl WireReader {
    #[inline]
    pub fn state(&self) -> BoltState {
        BoltState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, s: BoltState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Field names captured from the most recent RUN SUCCESS.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Block until one complete message is framed, dispatch it through the
    /// (state, tag) table, and return its status. Messages already buffered
    /// are served without touching the socket.
    pub fn recv_message(&mut self, sink: &mut dyn ReplySink) -> Status {
        loop {
            if let Some(len) = frame::message_len(self.buf.readable()) {
                let status = self.handle_message(len, sink);
                self.buf.consume(len);
                if self.buf.is_empty() {
                    self.buf.reset();
                }
                return status;
            }

            self.buf.ensure_space(RECV_CHUNK);
            match self.stream.read(self.buf.writable()) {
                Ok(0) => {
                    debug!("wire: peer closed");
                    self.set_state(BoltState::Disconnected);
                    return Status::new(Action::Retry, Domain::Syscall, Code::None, 0);
                }
                Ok(n) => {
                    self.buf.advance(n);
                    self.buf.update_stats(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.set_state(BoltState::Disconnected);
                    return Status::io(Action::Retry, Code::None, &e);
                }
            }
        }
    }

    /// Between queries, let the buffer relax toward recent traffic volume.
    pub fn maybe_shrink(&mut self) {
        if self.state() == BoltState::Ready && self.buf.is_empty() {
            self.buf.reset();
            self.buf.shrink();
        }
    }

    fn handle_message(&mut self, len: usize, sink: &mut dyn ReplySink) -> Status {
        let state = self.state();
        let reply = {
            let msg = &self.buf.readable()[..len];
            dispatch(state, self.version, self.handshaking, msg, sink)
        };

        if reply.run_done {
            let _ = self.pending_runs.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |n| n.checked_sub(1),
            );
        }
        if reply.clear_runs {
            self.pending_runs.store(0, Ordering::Release);
        }
        if let Some(next) = reply.new_state {
            // A finished stream flows straight into the next pipelined RUN's
            // replies rather than idling in Ready.
            let next = if next == BoltState::Ready
                && matches!(state, BoltState::Pull | BoltState::Streaming)
                && self.pending_runs.load(Ordering::Acquire) > 0
            {
                BoltState::Run
            } else {
                next
            };
            self.set_state(next);
        }
        if let Some(err) = reply.error {
            debug!(%err, "wire: failure recorded");
            self.last_error = err;
        }
        if let Some(fields) = reply.fields {
            self.fields = fields;
        }
        reply.status
    }

    /// Unblock a reader parked in `recv`.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// The (state, reply-tag) table. Pure over its inputs: transitions and
/// captured metadata come back in the [`Reply`] so the caller applies them
/// after buffer borrows end.
fn dispatch(
    state: BoltState,
    version: Version,
    handshaking: bool,
    msg: &[u8],
    sink: &mut dyn ReplySink,
) -> Reply {
    let body = match frame::single_body(msg) {
        Ok(b) if b.is_empty() => return Reply::ok(), // keep-alive
        Ok(b) => b,
        Err(e) => return proto_error(&format!("bad framing: {e}")),
    };

    let mut reader = Reader::new(body);
    let value = match decode_value(&mut reader) {
        Ok(v) => v,
        Err(e) => return proto_error(&format!("bad reply: {e}")),
    };
    let Some(reply_struct) = value.as_struct() else {
        return proto_error("reply body is not a struct");
    };

    match (state, reply_struct.tag) {
        (BoltState::Connecting, message::SUCCESS) if handshaking => {
            if version.supports_logon() {
                Reply::with_state(BoltState::Logon)
            } else {
                Reply::with_state(BoltState::Ready)
            }
        }
        // LOGOFF ack after the handshake: stay unauthenticated.
        (BoltState::Connecting, message::SUCCESS) => Reply::ok(),

        (BoltState::Logon, message::SUCCESS) => Reply::with_state(BoltState::Ready),

        (BoltState::Run, message::SUCCESS) => {
            // Field-name metadata for the upcoming records.
            Reply {
                fields: Some(field_names(reply_struct)),
                run_done: true,
                ..Reply::with_state(BoltState::Pull)
            }
        }

        (BoltState::Pull | BoltState::Streaming, message::SUCCESS) => {
            // Stream summary. Anything without an explicit has_more=true ends
            // the stream.
            let has_more = reply_struct
                .field(0)
                .as_map()
                .is_some_and(|meta| meta.get("has_more").as_bool() == Some(true));
            let status = if has_more {
                Status::new(Action::HasMore, Domain::None, Code::None, 0)
            } else {
                Status::OK
            };
            sink.on_complete(Outcome::Summary { has_more }, body, status);
            if has_more {
                Reply { status, ..Reply::with_state(BoltState::Pull) }
            } else {
                Reply::with_state(BoltState::Ready)
            }
        }

        (BoltState::Pull | BoltState::Streaming, message::RECORD) => {
            sink.on_record(body);
            if state == BoltState::Pull {
                Reply::with_state(BoltState::Streaming)
            } else {
                Reply::ok()
            }
        }

        // Control-message acks: BEGIN/COMMIT/ROLLBACK/TELEMETRY land here.
        (BoltState::Ready, message::SUCCESS) => {
            sink.on_complete(Outcome::Ack, body, Status::OK);
            Reply::ok()
        }

        // RESET/ACK_FAILURE ack recovers the connection; queued work was
        // thrown away server-side.
        (BoltState::Error, message::SUCCESS) => {
            sink.on_complete(Outcome::Ack, body, Status::OK);
            Reply { clear_runs: true, ..Reply::with_state(BoltState::Ready) }
        }

        (s, message::IGNORED) if s != BoltState::Disconnected => {
            sink.on_complete(Outcome::Ignored, body, Status::OK);
            Reply::ok()
        }

        (BoltState::Connecting | BoltState::Logon, message::FAILURE) => {
            let error = failure_text(reply_struct);
            let status =
                Status::new(Action::Fail, Domain::Server, Code::ServerConnect, 0);
            sink.on_complete(Outcome::Failed, body, status);
            Reply {
                status,
                new_state: Some(BoltState::Disconnected),
                error: Some(error),
                ..Reply::ok()
            }
        }

        (
            BoltState::Run | BoltState::Pull | BoltState::Streaming | BoltState::Ready
            | BoltState::Error,
            message::FAILURE,
        ) => {
            let error = failure_text(reply_struct);
            let status = Status::new(Action::Reset, Domain::Server, Code::ServerQuery, 0);
            sink.on_complete(Outcome::Failed, body, status);
            Reply {
                status,
                new_state: Some(BoltState::Error),
                error: Some(error),
                // A RUN that failed outright still consumed its reply.
                run_done: state == BoltState::Run,
                ..Reply::ok()
            }
        }

        (state, tag) => {
            warn!(?state, tag, "wire: reply illegal in this state");
            Reply {
                status: Status::new(Action::Fail, Domain::WireProto, Code::Decode, tag as u32),
                new_state: Some(BoltState::Error),
                error: Some(format!("reply tag 0x{tag:02X} illegal in state {state:?}")),
                ..Reply::ok()
            }
        }
    }
}

fn proto_error(msg: &str) -> Reply {
    Reply {
        status: Status::new(Action::Fail, Domain::WireProto, Code::Decode, 0),
        new_state: Some(BoltState::Error),
        error: Some(msg.to_string()),
        ..Reply::ok()
    }
}

/// `{"fields": ["a", "b", ...]}` from a RUN SUCCESS.
fn field_names(reply: bolt_codec::Struct<'_>) -> Vec<String> {
    let Some(meta) = reply.field(0).as_map() else {
        return Vec::new();
    };
    match meta.get("fields") {
        Value::List(list) => list
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// `{"code": ..., "message": ...}` from a FAILURE.
fn failure_text(reply: bolt_codec::Struct<'_>) -> String {
    let Some(meta) = reply.field(0).as_map() else {
        return "server failure".to_string();
    };
    match (meta.get("code").as_str(), meta.get("message").as_str()) {
        (Some(code), Some(msg)) => format!("{code}: {msg}"),
        (Some(code), None) => code.to_string(),
        (None, Some(msg)) => msg.to_string(),
        (None, None) => format!("{}", Value::Map(meta)),
    }
}

/// Ask the kernel for matching send and receive buffers on the socket.
/// Best-effort: a refusal is logged and the connection proceeds on the
/// kernel defaults.
fn set_socket_buf_size(stream: &TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        let value = size as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                std::ptr::from_ref(&value).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!(opt, size, "setsockopt refused, keeping kernel default");
        }
    }
}
