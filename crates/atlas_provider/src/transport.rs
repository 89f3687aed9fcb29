//! Transport - pluggable low-level fetches
//!
//! The runtime never performs storage I/O itself; it begins fetches on a
//! host-supplied transport and observes their completion from the
//! cooperative poll loop. Two implementations ship here: an in-memory
//! transport for local content and tests, and a worker transport that
//! runs a host I/O function on a background thread and delivers results
//! over a channel, observed by the next poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use atlas_core::FetchError;

/// One fetch request.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    /// Storage path or transport id to fetch
    pub path: String,
    /// Optional request timeout, enforced by the transport
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Identifier of an in-flight fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TicketId(pub u64);

/// Observed state of an in-flight fetch. `Done`/`Failed` are reported
/// once; the ticket is forgotten afterwards.
pub enum FetchPoll {
    Pending(f32),
    Done(Vec<u8>),
    Failed(FetchError),
}

/// Host-supplied I/O layer.
pub trait Transport: Send + Sync {
    /// Start a fetch; never blocks.
    fn begin(&self, request: FetchRequest) -> TicketId;

    /// Observe the fetch. Completion is seen by whichever poll comes
    /// after the underlying I/O finished.
    fn poll(&self, ticket: TicketId) -> FetchPoll;

    /// Abandon an in-flight fetch. There is no mid-flight cancellation of
    /// the underlying I/O; the result is simply discarded.
    fn cancel(&self, ticket: TicketId);
}

struct Flight {
    path: String,
    remaining: u32,
    total: u32,
}

struct MemoryInner {
    entries: HashMap<String, Vec<u8>>,
    latency: u32,
    fail_next: HashMap<String, Vec<FetchError>>,
    in_flight: HashMap<u64, Flight>,
    begin_counts: HashMap<String, u32>,
    next_ticket: u64,
}

/// In-memory transport serving a registered path→bytes map.
///
/// Fetches complete after a configurable number of polls, so operation
/// scheduling is fully deterministic. Failures can be scripted per path
/// for retry testing.
pub struct MemoryTransport {
    inner: Mutex<MemoryInner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: HashMap::new(),
                latency: 0,
                fail_next: HashMap::new(),
                in_flight: HashMap::new(),
                begin_counts: HashMap::new(),
                next_ticket: 1,
            }),
        }
    }

    /// Every fetch stays pending for `polls` polls before completing.
    pub fn with_latency(polls: u32) -> Self {
        let t = Self::new();
        t.inner.lock().latency = polls;
        t
    }

    /// Register content at a path
    pub fn insert(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.inner.lock().entries.insert(path.into(), bytes);
    }

    /// Register UTF-8 content at a path
    pub fn insert_text(&self, path: impl Into<String>, text: impl Into<String>) {
        self.insert(path, text.into().into_bytes());
    }

    /// Remove content, making subsequent fetches fail with `NotFound`
    pub fn remove(&self, path: &str) {
        self.inner.lock().entries.remove(path);
    }

    /// Script the next fetch of `path` to fail with `error` (stacks)
    pub fn fail_next(&self, path: impl Into<String>, error: FetchError) {
        self.inner.lock().fail_next.entry(path.into()).or_default().push(error);
    }

    /// How many fetches were started for `path`
    pub fn begin_count(&self, path: &str) -> u32 {
        self.inner.lock().begin_counts.get(path).copied().unwrap_or(0)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn begin(&self, request: FetchRequest) -> TicketId {
        let mut inner = self.inner.lock();
        let id = inner.next_ticket;
        inner.next_ticket += 1;
        *inner.begin_counts.entry(request.path.clone()).or_insert(0) += 1;
        let latency = inner.latency;
        inner.in_flight.insert(
            id,
            Flight {
                path: request.path,
                remaining: latency,
                total: latency,
            },
        );
        TicketId(id)
    }

    fn poll(&self, ticket: TicketId) -> FetchPoll {
        let mut inner = self.inner.lock();
        {
            let Some(flight) = inner.in_flight.get_mut(&ticket.0) else {
                return FetchPoll::Failed(FetchError::Read("unknown ticket".to_string()));
            };
            if flight.remaining > 0 {
                flight.remaining -= 1;
                let total = flight.total.max(1) as f32;
                return FetchPoll::Pending((total - flight.remaining as f32) / (total + 1.0));
            }
        }
        let flight = match inner.in_flight.remove(&ticket.0) {
            Some(f) => f,
            None => return FetchPoll::Failed(FetchError::Read("unknown ticket".to_string())),
        };
        if let Some(scripted) = inner.fail_next.get_mut(&flight.path) {
            if let Some(error) = scripted.pop() {
                return FetchPoll::Failed(error);
            }
        }
        match inner.entries.get(&flight.path) {
            Some(bytes) => FetchPoll::Done(bytes.clone()),
            None => FetchPoll::Failed(FetchError::NotFound(flight.path)),
        }
    }

    fn cancel(&self, ticket: TicketId) {
        self.inner.lock().in_flight.remove(&ticket.0);
    }
}

/// Host I/O function run by the worker transport.
pub type IoFn = Arc<dyn Fn(&str) -> Result<Vec<u8>, FetchError> + Send + Sync>;

enum WorkerMsg {
    Fetch { id: u64, request: FetchRequest },
    Shutdown,
}

struct WorkerInner {
    results: HashMap<u64, Result<Vec<u8>, FetchError>>,
    cancelled: std::collections::HashSet<u64>,
    next_ticket: u64,
}

/// Transport running a host I/O function on a background worker thread.
///
/// The only work that executes off the cooperative loop is the I/O
/// itself; completions travel back over a channel and become visible on
/// the poll after they arrive.
pub struct WorkerTransport {
    tx: Sender<WorkerMsg>,
    rx: Receiver<(u64, Result<Vec<u8>, FetchError>)>,
    inner: Mutex<WorkerInner>,
}

impl WorkerTransport {
    pub fn new(io: IoFn) -> Self {
        let (tx, worker_rx) = unbounded::<WorkerMsg>();
        let (done_tx, rx) = unbounded();
        std::thread::spawn(move || {
            while let Ok(msg) = worker_rx.recv() {
                match msg {
                    WorkerMsg::Fetch { id, request } => {
                        let result = io(&request.path);
                        if done_tx.send((id, result)).is_err() {
                            break;
                        }
                    }
                    WorkerMsg::Shutdown => break,
                }
            }
        });
        Self {
            tx,
            rx,
            inner: Mutex::new(WorkerInner {
                results: HashMap::new(),
                cancelled: std::collections::HashSet::new(),
                next_ticket: 1,
            }),
        }
    }

    fn drain(&self, inner: &mut WorkerInner) {
        while let Ok((id, result)) = self.rx.try_recv() {
            if !inner.cancelled.remove(&id) {
                inner.results.insert(id, result);
            }
        }
    }
}

impl Transport for WorkerTransport {
    fn begin(&self, request: FetchRequest) -> TicketId {
        let mut inner = self.inner.lock();
        let id = inner.next_ticket;
        inner.next_ticket += 1;
        if self.tx.send(WorkerMsg::Fetch { id, request }).is_err() {
            inner
                .results
                .insert(id, Err(FetchError::Connection("worker stopped".to_string())));
        }
        TicketId(id)
    }

    fn poll(&self, ticket: TicketId) -> FetchPoll {
        let mut inner = self.inner.lock();
        self.drain(&mut inner);
        match inner.results.remove(&ticket.0) {
            Some(Ok(bytes)) => FetchPoll::Done(bytes),
            Some(Err(e)) => FetchPoll::Failed(e),
            None => FetchPoll::Pending(0.0),
        }
    }

    fn cancel(&self, ticket: TicketId) {
        let mut inner = self.inner.lock();
        self.drain(&mut inner);
        if inner.results.remove(&ticket.0).is_none() {
            inner.cancelled.insert(ticket.0);
        }
    }
}

impl Drop for WorkerTransport {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMsg::Shutdown);
    }
}
