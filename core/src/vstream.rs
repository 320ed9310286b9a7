//! The virtual stream (spec §4.2, component C2): a lazy merge of a
//! persisted cursor and an in-memory sequence, with pause/resume/destroy
//! and a uniform filter across both sources.

use crate::store::DocStream;
use crate::revision::RevBody;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Where the in-memory sequence sits relative to the persisted cursor.
/// `Prepend` emits memory items before the persisted ones (the common case:
/// memory holds items newer than what's on disk and direction is `Desc`);
/// `Append` emits them after.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Prepend,
    Append,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VStreamError {
    #[error("stream() already called on this virtual stream")]
    AlreadyDrained,
    #[error("virtual stream was destroyed")]
    Destroyed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Streaming,
    Paused,
    Destroyed,
}

struct Inner {
    state: State,
    resume: Arc<Notify>,
}

type Filter = Arc<dyn Fn(&RevBody) -> bool + Send + Sync>;

/// Merges a [`DocStream`] (the persisted cursor, `P`) with a `Vec<RevBody>`
/// (the in-memory sequence, `V`) into one logical stream. Consumed exactly
/// once: calling [`Self::stream`] a second time, or after [`Self::destroy`],
/// fails immediately rather than returning an empty stream, so callers
/// can't mistake "already drained" for "legitimately empty".
pub struct VirtualStream {
    persisted: Option<DocStream>,
    memory: VecDeque<RevBody>,
    direction: Direction,
    mode: Mode,
    filter: Option<Filter>,
    inner: Arc<Mutex<Inner>>,
}

impl VirtualStream {
    pub fn new(persisted: DocStream, memory: Vec<RevBody>, direction: Direction, mode: Mode) -> Self {
        Self {
            persisted: Some(persisted),
            memory: memory.into(),
            direction,
            mode,
            filter: None,
            inner: Arc::new(Mutex::new(Inner {
                state: State::Idle,
                resume: Arc::new(Notify::new()),
            })),
        }
    }

    /// Applies `f` to every item from both sources before it's yielded.
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&RevBody) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Suspends delivery; the returned stream from [`Self::stream`] simply
    /// stalls at its next poll until [`Self::resume`] is called.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Streaming {
            inner.state = State::Paused;
        }
    }

    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Paused {
            inner.state = State::Streaming;
            inner.resume.notify_waiters();
        }
    }

    /// Tears the stream down. A stream already handed out from
    /// [`Self::stream`] stops yielding at its next poll.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Destroyed;
        inner.resume.notify_waiters();
    }

    /// Consumes the sources and returns the merged stream. May only be
    /// called once per `VirtualStream`.
    pub fn stream(&mut self) -> Result<Pin<Box<dyn Stream<Item = RevBody> + Send>>, VStreamError> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                State::Destroyed => return Err(VStreamError::Destroyed),
                State::Streaming | State::Paused => return Err(VStreamError::AlreadyDrained),
                State::Idle => inner.state = State::Streaming,
            }
        }
        let persisted = self
            .persisted
            .take()
            .ok_or(VStreamError::AlreadyDrained)?;
        let memory = std::mem::take(&mut self.memory);
        let filter = self.filter.clone();
        let inner = self.inner.clone();

        // Per spec: `asc`+`prepend` and `desc`+`append` are the "normal"
        // combinations (memory-first, persisted-first respectively); the
        // other two combinations invert that order.
        let inverted = matches!(
            (self.direction, self.mode),
            (Direction::Asc, Mode::Append) | (Direction::Desc, Mode::Prepend)
        );
        let memory_first = matches!(self.mode, Mode::Prepend) ^ inverted;

        let merged: Pin<Box<dyn Stream<Item = RevBody> + Send>> = if memory_first {
            Box::pin(stream::iter(memory).chain(persisted))
        } else {
            Box::pin(persisted.chain(stream::iter(memory)))
        };

        let gated = stream::unfold((merged, inner), move |(mut merged, inner)| async move {
            loop {
                {
                    let state = inner.lock().state;
                    if state == State::Destroyed {
                        return None;
                    }
                    if state == State::Paused {
                        let notify = inner.lock().resume.clone();
                        notify.notified().await;
                        continue;
                    }
                }
                return merged.next().await.map(|item| (item, (merged, inner)));
            }
        });

        let filtered: Pin<Box<dyn Stream<Item = RevBody> + Send>> = match filter {
            Some(f) => Box::pin(gated.filter(move |item| {
                let keep = f(item);
                async move { keep }
            })),
            None => Box::pin(gated),
        };
        Ok(filtered)
    }
}
