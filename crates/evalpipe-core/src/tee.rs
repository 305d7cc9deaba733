//! Forking a single-pass lazy stream into independently advancing views.
//!
//! All forks share one cursor on the underlying stream. Pulling an element
//! that no fork has seen yet polls the source once and buffers the element
//! for every fork that has not passed that index; an element is dropped from
//! the buffer as soon as the slowest live fork has consumed it.
//!
//! ```text
//! source ──► [ buffer: base .. base+len ] ──► fork 0 (cursor 3)
//!                                        ├──► fork 1 (cursor 1)  <- slowest
//!                                        └──► fork 2 (cursor 5)  <- pulls next
//! ```
//!
//! A fork that finds the source pending registers in a shared waker set;
//! the source is always polled with a waker that wakes every registered
//! fork, so whichever fork completes the pull, the others observe it.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};

use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};

/// Fork `stream` into `n` views with unbounded buffering.
pub fn tee<S>(stream: S, n: usize) -> Vec<TeeStream<S::Item>>
where
    S: Stream + Send + 'static,
    S::Item: Clone + Send + 'static,
{
    forks(Shared::new(stream.boxed(), None), n)
}

/// Fork `stream` into `n` views. A fork that is `max_lag` elements ahead of
/// the slowest live fork stays pending until the slowest one advances.
///
/// Every fork must be driven for the group to make progress: a fork that is
/// never polled (but not dropped) eventually stalls all the others.
pub fn tee_with_max_lag<S>(stream: S, n: usize, max_lag: usize) -> Vec<TeeStream<S::Item>>
where
    S: Stream + Send + 'static,
    S::Item: Clone + Send + 'static,
{
    forks(Shared::new(stream.boxed(), Some(max_lag.max(1))), n)
}

fn forks<T>(shared: Arc<Mutex<Shared<T>>>, n: usize) -> Vec<TeeStream<T>> {
    (0..n).map(|_| TeeStream::attach(&shared, 0)).collect()
}

/// End a stream right after its first `Err` item, so the error is the
/// terminal event every fork observes at the same position.
pub fn fuse_on_err<S, T, E>(stream: S) -> impl Stream<Item = Result<T, E>>
where
    S: Stream<Item = Result<T, E>>,
{
    stream.scan(false, |failed, item| {
        if *failed {
            return future::ready(None);
        }
        *failed = item.is_err();
        future::ready(Some(item))
    })
}

/// One view over a forked stream.
///
/// Cloning a `TeeStream` forks it: the clone starts at the same position
/// and advances independently.
pub struct TeeStream<T> {
    shared: Arc<Mutex<Shared<T>>>,
    id: u64,
}

struct Shared<T> {
    /// `None` once the source has ended.
    source: Option<BoxStream<'static, T>>,
    buffer: VecDeque<T>,
    /// Absolute index of `buffer[0]`.
    base: usize,
    /// Absolute index of the next element each live fork will yield.
    cursors: HashMap<u64, usize>,
    next_id: u64,
    max_lag: Option<usize>,
    pulling: Arc<WakerSet>,
    lagging: Vec<Waker>,
}

/// Wakers of forks waiting on the source.
#[derive(Default)]
struct WakerSet {
    wakers: Mutex<Vec<Waker>>,
}

impl WakerSet {
    fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.wakers.lock().unwrap_or_else(PoisonError::into_inner));
        for waker in wakers {
            waker.wake();
        }
    }
}

impl Wake for WakerSet {
    fn wake(self: Arc<Self>) {
        self.wake_all();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_all();
    }
}

impl<T> Shared<T> {
    fn new(source: BoxStream<'static, T>, max_lag: Option<usize>) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Shared {
            source: Some(source),
            buffer: VecDeque::new(),
            base: 0,
            cursors: HashMap::new(),
            next_id: 0,
            max_lag,
            pulling: Arc::new(WakerSet::default()),
            lagging: Vec::new(),
        }))
    }

    fn register_at(&mut self, position: usize) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.cursors.insert(id, position);
        id
    }

    fn slowest(&self) -> usize {
        self.cursors
            .values()
            .copied()
            .min()
            .unwrap_or(self.base + self.buffer.len())
    }

    fn advance(&mut self, id: u64) {
        if let Some(cursor) = self.cursors.get_mut(&id) {
            *cursor += 1;
        }
        self.trim();
    }

    /// Drop elements every live fork has consumed.
    fn trim(&mut self) {
        let slowest = self.slowest();
        let mut trimmed = false;
        while self.base < slowest && !self.buffer.is_empty() {
            self.buffer.pop_front();
            self.base += 1;
            trimmed = true;
        }
        if trimmed {
            self.wake_lagging();
        }
    }

    fn wake_lagging(&mut self) {
        for waker in self.lagging.drain(..) {
            waker.wake();
        }
    }
}

impl<T: Clone> Shared<T> {
    fn poll_fork(&mut self, id: u64, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let Some(&position) = self.cursors.get(&id) else {
            return Poll::Ready(None);
        };

        if position < self.base + self.buffer.len() {
            let item = self.buffer[position - self.base].clone();
            self.advance(id);
            return Poll::Ready(Some(item));
        }

        if let Some(max_lag) = self.max_lag {
            if position - self.slowest() >= max_lag {
                if !self.lagging.iter().any(|w| w.will_wake(cx.waker())) {
                    self.lagging.push(cx.waker().clone());
                }
                return Poll::Pending;
            }
        }

        let Some(source) = self.source.as_mut() else {
            return Poll::Ready(None);
        };

        self.pulling.register(cx.waker());
        let waker = Waker::from(Arc::clone(&self.pulling));
        let mut source_cx = Context::from_waker(&waker);
        match source.as_mut().poll_next(&mut source_cx) {
            Poll::Ready(Some(item)) => {
                self.buffer.push_back(item.clone());
                self.advance(id);
                self.pulling.wake_all();
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                tracing::debug!(len = self.base + self.buffer.len(), "tee source exhausted");
                self.source = None;
                self.pulling.wake_all();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn lock<T>(shared: &Mutex<Shared<T>>) -> MutexGuard<'_, Shared<T>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> TeeStream<T> {
    fn attach(shared: &Arc<Mutex<Shared<T>>>, position: usize) -> Self {
        let id = lock(shared).register_at(position);
        Self {
            shared: Arc::clone(shared),
            id,
        }
    }
}

impl<T> TeeStream<T>
where
    T: Clone + Send + 'static,
{
    /// Wrap a stream as a single forkable view.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::attach(&Shared::new(stream.boxed(), None), 0)
    }

    /// Create another view starting at this view's current position.
    pub fn fork(&self) -> Self {
        let position = {
            let shared = lock(&self.shared);
            shared.cursors.get(&self.id).copied().unwrap_or(shared.base)
        };
        Self::attach(&self.shared, position)
    }

    /// Number of elements currently held for lagging forks.
    pub fn buffered(&self) -> usize {
        lock(&self.shared).buffer.len()
    }
}

impl<T> Clone for TeeStream<T>
where
    T: Clone + Send + 'static,
{
    fn clone(&self) -> Self {
        self.fork()
    }
}

impl<T: Clone> Stream for TeeStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        lock(&this.shared).poll_fork(this.id, cx)
    }
}

impl<T> Drop for TeeStream<T> {
    fn drop(&mut self) {
        let mut shared = lock(&self.shared);
        shared.cursors.remove(&self.id);
        shared.trim();
        shared.wake_lagging();
        shared.pulling.wake_all();
    }
}
