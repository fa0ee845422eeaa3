use std::{
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle, Thread},
    time::Duration,
};

use bolt_codec::{List, Map, Value, encode_to_vec};
use quanta::Instant;
use spin::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::DriverConfig,
    connection::{BoltState, Connection, Outcome, ReplySink, WireReader, WireWriter},
    histogram::LatencyHistogram,
    queue::RingQueue,
    status::{Action, Code, Domain, Status},
    worker::{WorkerRole, boot_worker},
};

/// Invoked on the decoder thread when a command completes. Must not block;
/// the connection's receive path runs underneath it.
pub type Callback = Box<dyn Fn(&CellResult) + Send + 'static>;

/// Pre-packed empty map value, the default for params/extras/options.
pub fn packed_empty_map() -> Vec<u8> {
    vec![0xA0]
}

/// Pack string-keyed parameters into a wire-format map.
pub fn pack_params<'a>(pairs: &[(&'a str, Value<'a>)]) -> Vec<u8> {
    let keys: Vec<Value<'a>> = pairs.iter().map(|&(k, _)| Value::String(k)).collect();
    let vals: Vec<Value<'a>> = pairs.iter().map(|&(_, v)| v).collect();
    encode_to_vec(&Value::map(&keys, &vals))
}

/// Commands a cell executes in enqueue order. Parameter maps travel
/// pre-packed (see [`pack_params`]) so commands stay `Send` without copying
/// value trees.
pub enum Command {
    Run { cypher: String, params: Vec<u8>, extras: Vec<u8>, n: i64, cb: Option<Callback> },
    Begin { options: Vec<u8>, cb: Option<Callback> },
    Commit { cb: Option<Callback> },
    Rollback { cb: Option<Callback> },
    Pull { n: i64 },
    Discard { n: i64 },
    Reset,
    Logoff,
}

impl Command {
    /// RUN with empty params/extras, streaming all records.
    pub fn run(cypher: impl Into<String>) -> Self {
        Command::Run {
            cypher: cypher.into(),
            params: packed_empty_map(),
            extras: packed_empty_map(),
            n: -1,
            cb: None,
        }
    }

    pub fn run_with(
        cypher: impl Into<String>,
        params: Vec<u8>,
        extras: Vec<u8>,
        n: i64,
    ) -> Self {
        Command::Run { cypher: cypher.into(), params, extras, n, cb: None }
    }

    pub fn with_callback(mut self, cb: Callback) -> Self {
        match &mut self {
            Command::Run { cb: slot, .. }
            | Command::Begin { cb: slot, .. }
            | Command::Commit { cb: slot }
            | Command::Rollback { cb: slot } => *slot = Some(cb),
            _ => {}
        }
        self
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Run { cypher, n, .. } => {
                f.debug_struct("Run").field("cypher", cypher).field("n", n).finish()
            }
            Command::Begin { .. } => f.write_str("Begin"),
            Command::Commit { .. } => f.write_str("Commit"),
            Command::Rollback { .. } => f.write_str("Rollback"),
            Command::Pull { n } => f.debug_struct("Pull").field("n", n).finish(),
            Command::Discard { n } => f.debug_struct("Discard").field("n", n).finish(),
            Command::Reset => f.write_str("Reset"),
            Command::Logoff => f.write_str("Logoff"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultKind {
    Empty,
    /// One record; payload decodes to a one-field struct holding the value
    /// list.
    Record,
    /// Stream summary; `status.action() == HasMore` when the stream resumes
    /// on the next PULL.
    Summary,
    /// Ack of a control command (BEGIN/COMMIT/ROLLBACK/RESET/...).
    Ack,
    /// The server skipped the command after an earlier failure.
    Ignored,
    Failure,
}

/// What `fetch` hands back. Owns its payload bytes (copied once out of the
/// connection buffer) and decodes lazily on access.
pub struct CellResult {
    kind: ResultKind,
    status: Status,
    payload: Vec<u8>,
}

impl CellResult {
    pub fn empty() -> Self {
        Self { kind: ResultKind::Empty, status: Status::OK, payload: Vec::new() }
    }

    fn new(kind: ResultKind, status: Status, payload: &[u8]) -> Self {
        Self { kind, status, payload: payload.to_vec() }
    }

    #[inline]
    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    /// The reply struct, decoded over this result's own bytes.
    pub fn value(&self) -> Option<Value<'_>> {
        if self.payload.is_empty() {
            return None;
        }
        let mut reader = bolt_codec::Reader::new(&self.payload);
        bolt_codec::decode_value(&mut reader).ok()
    }

    /// The value list of a record result.
    pub fn record(&self) -> Option<List<'_>> {
        if self.kind != ResultKind::Record {
            return None;
        }
        match self.value()?.as_struct()?.field(0) {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// The metadata map of a summary/ack/failure result.
    pub fn metadata(&self) -> Option<Map<'_>> {
        self.value()?.as_struct()?.field(0).as_map()
    }
}

impl std::fmt::Debug for CellResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellResult")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

struct Queued {
    cmd: Command,
    t0: Instant,
}

/// One entry per command that elicits a terminal reply; the decoder pops in
/// reply order (the wire preserves command order) to pair latencies and
/// callbacks.
struct Inflight {
    t0: Instant,
    cb: Option<Callback>,
}

struct CellShared {
    commands: RingQueue<Queued>,
    results: RingQueue<CellResult>,
    /// Completions that never reach the wire (depth-elided transactions,
    /// illegal-state refusals). Separate ring so the encoder and decoder each
    /// keep a queue they alone produce into.
    local_results: RingQueue<CellResult>,
    inflight: RingQueue<Inflight>,

    running: AtomicBool,
    /// 1 while the encoder thread is parked on an empty command queue.
    esleep: AtomicI32,
    /// 1 while a fetching user thread is parked on an empty result queue.
    dsleep: AtomicI32,

    enc_thread: Mutex<Option<Thread>>,
    fetch_thread: Mutex<Option<Thread>>,

    state: Mutex<Option<Arc<AtomicU8>>>,
    sock: Mutex<Option<TcpStream>>,

    hist: Mutex<LatencyHistogram>,
    last_error: Mutex<String>,
    fields: Mutex<Vec<String>>,

    try_count: AtomicU32,
    max_tries: AtomicU32,
}

impl CellShared {
    fn new(config: &DriverConfig) -> Self {
        Self {
            commands: RingQueue::new(config.queue_capacity),
            results: RingQueue::new(config.queue_capacity),
            local_results: RingQueue::new(config.queue_capacity),
            inflight: RingQueue::new(config.queue_capacity),
            running: AtomicBool::new(false),
            esleep: AtomicI32::new(0),
            dsleep: AtomicI32::new(0),
            enc_thread: Mutex::new(None),
            fetch_thread: Mutex::new(None),
            state: Mutex::new(None),
            sock: Mutex::new(None),
            hist: Mutex::new(LatencyHistogram::new()),
            last_error: Mutex::new(String::new()),
            fields: Mutex::new(Vec::new()),
            try_count: AtomicU32::new(0),
            max_tries: AtomicU32::new(config.max_tries),
        }
    }

    fn post_result(&self, result: CellResult) {
        Self::push_spinning(&self.results, result);
        self.wake_fetcher();
    }

    fn post_local_result(&self, result: CellResult) {
        Self::push_spinning(&self.local_results, result);
        self.wake_fetcher();
    }

    fn push_spinning<T>(queue: &RingQueue<T>, mut item: T) {
        loop {
            match queue.push(item) {
                Ok(()) => break,
                Err(back) => {
                    item = back;
                    thread::yield_now();
                }
            }
        }
    }

    fn wake_fetcher(&self) {
        if self.dsleep.load(Ordering::Acquire) == 1 {
            if let Some(t) = self.fetch_thread.lock().as_ref() {
                t.unpark();
            }
        }
    }

    fn record_latency(&self, t0: Instant) {
        let ns = (Instant::now() - t0).as_nanos() as u64;
        self.hist.lock().record(ns);
    }

    fn set_error(&self, err: &str) {
        if !err.is_empty() {
            *self.last_error.lock() = err.to_string();
        }
    }
}

/// Pairs replies arriving on the decoder thread with their inflight entries
/// and publishes results.
struct DecoderSink<'a> {
    shared: &'a CellShared,
}

impl ReplySink for DecoderSink<'_> {
    fn on_record(&mut self, payload: &[u8]) {
        self.shared.post_result(CellResult::new(ResultKind::Record, Status::OK, payload));
    }

    fn on_complete(&mut self, outcome: Outcome, payload: &[u8], status: Status) {
        let inflight = self.shared.inflight.pop();
        if let Some(inf) = &inflight {
            self.shared.record_latency(inf.t0);
        }

        let kind = match outcome {
            Outcome::Summary { .. } => ResultKind::Summary,
            Outcome::Ack => ResultKind::Ack,
            Outcome::Ignored => ResultKind::Ignored,
            Outcome::Failed => ResultKind::Failure,
        };
        let result = CellResult::new(kind, status, payload);
        if let Some(Inflight { cb: Some(cb), .. }) = &inflight {
            cb(&result);
        }
        self.shared.post_result(result);
    }
}

/// A single-connection worker: one encoder thread draining the command queue
/// into the socket, one decoder thread draining the socket into the result
/// queue. Commands execute in enqueue order; results come back in the same
/// order.
pub struct Cell {
    shared: Arc<CellShared>,
    config: Arc<DriverConfig>,
    client_id: u64,
    encoder: Option<JoinHandle<()>>,
    decoder: Option<JoinHandle<()>>,
}

impl Cell {
    pub fn new(config: Arc<DriverConfig>, client_id: u64) -> Self {
        Self {
            shared: Arc::new(CellShared::new(&config)),
            config,
            client_id,
            encoder: None,
            decoder: None,
        }
    }

    /// Connect, handshake, and launch the worker pair. Re-tries the
    /// connection up to `max_tries` times before giving up.
    pub fn start(&mut self) -> Status {
        if self.shared.running.load(Ordering::Acquire) {
            return Status::OK;
        }

        let conn = loop {
            match self.try_connect() {
                Ok(conn) => break conn,
                Err(status) => {
                    let tries = self.shared.try_count.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(cell = self.client_id, tries, %status, "cell connect failed");
                    if !self.can_retry() {
                        return status;
                    }
                }
            }
        };
        self.shared.try_count.store(0, Ordering::Release);

        *self.shared.state.lock() = Some(conn.state_handle());
        *self.shared.sock.lock() = conn.control_handle().ok();
        let (writer, reader) = conn.split();

        self.shared.running.store(true, Ordering::Release);

        let enc_shared = self.shared.clone();
        let enc_config = self.config.clone();
        let cell_id = self.client_id;
        self.encoder = Some(
            thread::Builder::new()
                .name(format!("bolt-enc-{cell_id}"))
                .spawn(move || encoder_loop(&enc_shared, writer, cell_id, &enc_config))
                .expect("spawn encoder thread"),
        );
        *self.shared.enc_thread.lock() =
            self.encoder.as_ref().map(|h| h.thread().clone());

        let dec_shared = self.shared.clone();
        let dec_config = self.config.clone();
        self.decoder = Some(
            thread::Builder::new()
                .name(format!("bolt-dec-{cell_id}"))
                .spawn(move || decoder_loop(&dec_shared, reader, cell_id, &dec_config))
                .expect("spawn decoder thread"),
        );

        info!(cell = self.client_id, "cell started");
        Status::OK
    }

    fn try_connect(&self) -> Result<Connection, Status> {
        let mut conn = Connection::open(self.config.clone(), self.client_id)?;
        let status = conn.start();
        if status.is_ok() {
            Ok(conn)
        } else {
            self.shared.set_error(conn.last_error());
            Err(status)
        }
    }

    /// Cell-wide shutdown: stop the loops, force the blocked reader off the
    /// socket, join both threads. In-flight commands surface as failures or
    /// ignored results.
    pub fn stop(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            debug!(cell = self.client_id, "cell stopping");
        }

        if let Some(t) = self.shared.enc_thread.lock().as_ref() {
            t.unpark();
        }
        if let Some(sock) = self.shared.sock.lock().as_ref() {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }

        if let Some(h) = self.encoder.take() {
            let _ = h.join();
        }
        if let Some(h) = self.decoder.take() {
            let _ = h.join();
        }

        if let Some(state) = self.shared.state.lock().as_ref() {
            state.store(BoltState::Disconnected as u8, Ordering::Release);
        }
        *self.shared.sock.lock() = None;
        *self.shared.enc_thread.lock() = None;
    }

    /// Queue a command for the encoder thread. Spin-yields while the ring is
    /// full; never blocks on a primitive.
    pub fn enqueue(&self, cmd: Command) -> Status {
        if !self.shared.running.load(Ordering::Acquire) {
            return Status::new(Action::Fail, Domain::InternalState, Code::None, 0);
        }

        let mut queued = Queued { cmd, t0: Instant::now() };
        loop {
            match self.shared.commands.push(queued) {
                Ok(()) => break,
                Err(back) => {
                    queued = back;
                    thread::yield_now();
                }
            }
        }

        if self.shared.esleep.load(Ordering::Acquire) == 1 {
            if let Some(t) = self.shared.enc_thread.lock().as_ref() {
                t.unpark();
            }
        }
        Status::OK
    }

    /// Next result in command order. Returns 1 for a record, 0 for a
    /// summary/ack (stream finished), negative on failure. Blocks
    /// (spin, then park) while the cell is live and nothing is queued.
    pub fn fetch(&self, out: &mut CellResult) -> i32 {
        let mut spins = 0u32;
        loop {
            if let Some(result) =
                self.shared.local_results.pop().or_else(|| self.shared.results.pop())
            {
                let code = match result.kind {
                    ResultKind::Record => 1,
                    ResultKind::Summary | ResultKind::Ack | ResultKind::Ignored
                    | ResultKind::Empty => 0,
                    ResultKind::Failure => -2,
                };
                *out = result;
                return code;
            }
            if !self.shared.running.load(Ordering::Acquire) {
                return -1;
            }

            spins += 1;
            if spins < 512 {
                std::hint::spin_loop();
            } else {
                *self.shared.fetch_thread.lock() = Some(thread::current());
                self.shared.dsleep.store(1, Ordering::Release);
                if self.shared.results.is_empty() && self.shared.local_results.is_empty() {
                    thread::park_timeout(Duration::from_micros(200));
                }
                self.shared.dsleep.store(0, Ordering::Release);
            }
        }
    }

    /// Non-blocking variant of [`fetch`]: `None` when nothing is queued.
    pub fn try_fetch(&self, out: &mut CellResult) -> Option<i32> {
        let result = self.shared.local_results.pop().or_else(|| self.shared.results.pop())?;
        let code = match result.kind {
            ResultKind::Record => 1,
            ResultKind::Failure => -2,
            _ => 0,
        };
        *out = result;
        Some(code)
    }

    /// Run the prescribed action for a status against this cell.
    pub fn handle_status(&mut self, status: Status) {
        match status.action() {
            Action::Ok | Action::HasMore | Action::Wait | Action::Flush => {}
            Action::Retry => {
                self.stop();
                if self.can_retry() {
                    let _ = self.start();
                } else {
                    warn!(cell = self.client_id, "retry budget exhausted");
                }
            }
            Action::Reset => {
                let _ = self.enqueue(Command::Reset);
            }
            Action::Reroute => {
                // Core carries the routed/standalone flag only; table refresh
                // belongs to the facade.
                warn!(cell = self.client_id, "routing refresh requested");
            }
            Action::Fail => self.stop(),
        }
    }

    pub fn is_connected(&self) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        self.shared
            .state
            .lock()
            .as_ref()
            .is_some_and(|s| BoltState::from_u8(s.load(Ordering::Acquire)) != BoltState::Disconnected)
    }

    pub fn get_last_error(&self) -> String {
        self.shared.last_error.lock().clone()
    }

    /// Field names from the most recent RUN SUCCESS.
    pub fn fields(&self) -> Vec<String> {
        self.shared.fields.lock().clone()
    }

    /// p-th percentile command latency in nanoseconds.
    pub fn percentile(&self, p: f64) -> u64 {
        self.shared.hist.lock().percentile(p)
    }

    /// Mean command latency in nanoseconds.
    pub fn wall_latency(&self) -> u64 {
        self.shared.hist.lock().wall_latency()
    }

    pub fn clear_histogram(&self) {
        self.shared.hist.lock().clear();
    }

    pub fn can_retry(&self) -> bool {
        self.shared.try_count.load(Ordering::Acquire) < self.shared.max_tries.load(Ordering::Acquire)
    }

    pub fn try_count(&self) -> u32 {
        self.shared.try_count.load(Ordering::Acquire)
    }

    pub fn set_retry_limit(&self, max_tries: u32) {
        self.shared.max_tries.store(max_tries, Ordering::Release);
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }
}

impl Drop for Cell {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sole consumer of the command queue; sole writer of the socket.
fn encoder_loop(shared: &CellShared, mut writer: WireWriter, cell: u64, config: &DriverConfig) {
    boot_worker(WorkerRole::Encoder, cell, config);
    let mut idle = 0u32;

    while shared.running.load(Ordering::Acquire) {
        let Some(queued) = shared.commands.pop() else {
            idle += 1;
            if idle < 1024 {
                std::hint::spin_loop();
            } else {
                // Bounded park; enqueue unparks us via the esleep flag.
                shared.esleep.store(1, Ordering::Release);
                if shared.commands.is_empty() && shared.running.load(Ordering::Acquire) {
                    thread::park_timeout(Duration::from_millis(1));
                }
                shared.esleep.store(0, Ordering::Release);
            }
            continue;
        };
        idle = 0;
        execute(shared, &mut writer, queued);
    }

    // Best-effort farewell; the socket may already be gone.
    let _ = writer.goodbye();
    debug!("encoder loop exit");
}

fn execute(shared: &CellShared, writer: &mut WireWriter, queued: Queued) {
    let Queued { cmd, t0 } = queued;
    let (status, sent, cb) = match cmd {
        Command::Run { cypher, params, extras, n, cb } => {
            (writer.run(&cypher, &params, &extras, n), true, cb)
        }
        Command::Begin { options, cb } => {
            let (status, sent) = writer.begin(&options);
            (status, sent, cb)
        }
        Command::Commit { cb } => {
            let (status, sent) = writer.commit();
            (status, sent, cb)
        }
        Command::Rollback { cb } => {
            let (status, sent) = writer.rollback();
            (status, sent, cb)
        }
        Command::Pull { n } => (writer.pull(n), true, None),
        Command::Discard { n } => (writer.discard(n), true, None),
        Command::Reset => (writer.reset(), true, None),
        Command::Logoff => (writer.logoff(), false, None),
    };

    if !status.is_ok() {
        // Never touched the wire or the send failed: complete locally.
        shared.set_error(&format!("command not sent: {status}"));
        let result = CellResult::new(ResultKind::Failure, status, &[]);
        if let Some(cb) = &cb {
            cb(&result);
        }
        shared.post_local_result(result);
        if status.domain() == Domain::Syscall {
            shared.running.store(false, Ordering::Release);
        }
        return;
    }

    if sent {
        let inflight = Inflight { t0, cb };
        CellShared::push_spinning(&shared.inflight, inflight);
    } else {
        // Depth-elided BEGIN/COMMIT/ROLLBACK or ignored control message:
        // ack immediately, no reply will come.
        shared.record_latency(t0);
        let result = CellResult::new(ResultKind::Ack, Status::OK, &[]);
        if let Some(cb) = &cb {
            cb(&result);
        }
        shared.post_local_result(result);
    }
}

/// Sole reader of the socket; drives the state machine and publishes
/// results.
fn decoder_loop(shared: &CellShared, mut reader: WireReader, cell: u64, config: &DriverConfig) {
    boot_worker(WorkerRole::Decoder, cell, config);

    while shared.running.load(Ordering::Acquire) {
        let status = {
            let mut sink = DecoderSink { shared };
            reader.recv_message(&mut sink)
        };

        if !reader.last_error().is_empty() {
            shared.set_error(reader.last_error());
        }
        {
            let mut fields = shared.fields.lock();
            if fields.as_slice() != reader.fields() {
                *fields = reader.fields().to_vec();
            }
        }

        match status.action() {
            Action::Ok | Action::HasMore => reader.maybe_shrink(),
            Action::Reset => {
                // Server failure: connection survives, caller resets.
                debug!(error = %reader.last_error(), "query failed");
            }
            _ => {
                if shared.running.swap(false, Ordering::AcqRel) {
                    warn!(%status, "decoder loop: connection lost");
                }
                break;
            }
        }
    }
    debug!("decoder loop exit");
}
