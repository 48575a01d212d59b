//! Deadline and cancellation propagation.
//!
//! A [`CallContext`] is a composable expiration + cancellation signal. Contexts
//! form a tree: a child inherits the earliest deadline of its parents and
//! fires whenever any parent fires, which is how a cancelled inbound request
//! cancels every outbound call made on its behalf.

use crate::error::Status;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Why a context fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Explicit cancellation of this context or an ancestor
    Cancelled,
    /// The deadline passed
    DeadlineExceeded,
}

impl Signal {
    pub fn to_status(self) -> Status {
        match self {
            Signal::Cancelled => Status::cancelled("call cancelled"),
            Signal::DeadlineExceeded => Status::deadline_exceeded("deadline exceeded"),
        }
    }
}

type Callback = Box<dyn FnOnce(Signal) + Send>;

/// Prune dead child links once the list grows past this many entries
const INITIAL_PRUNE_THRESHOLD: usize = 16;

struct Inner {
    deadline: Option<Instant>,
    fired: watch::Sender<Option<Signal>>,
    links: Mutex<Links>,
    timer: Mutex<Option<AbortHandle>>,
}

struct Links {
    children: Vec<Weak<Inner>>,
    callbacks: Vec<Callback>,
    prune_at: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking callback never runs while a lock is held, so a poisoned
    // lock still guards consistent data.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn current(&self) -> Option<Signal> {
        *self.fired.borrow()
    }

    fn fire(&self, signal: Signal) {
        let first = self.fired.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(signal);
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }

        let (children, callbacks) = {
            let mut links = lock(&self.links);
            (
                std::mem::take(&mut links.children),
                std::mem::take(&mut links.callbacks),
            )
        };

        for callback in callbacks {
            callback(signal);
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                child.fire(signal);
            }
        }
    }

    /// Register a child; returns the signal instead if this context already fired
    fn adopt(&self, child: &Arc<Inner>) -> Option<Signal> {
        let mut links = lock(&self.links);
        if let Some(signal) = self.current() {
            return Some(signal);
        }
        if links.children.len() >= links.prune_at {
            links.children.retain(|c| c.strong_count() > 0);
            links.prune_at = (links.children.len() * 2).max(INITIAL_PRUNE_THRESHOLD);
        }
        links.children.push(Arc::downgrade(child));
        None
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

/// Composable deadline + cancellation token.
///
/// Cloning is cheap and yields a handle to the same context.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<Inner>,
}

impl CallContext {
    /// A root context with no deadline that fires only on explicit cancellation
    pub fn background() -> Self {
        Self::build(None, &[])
    }

    /// Derive a child that expires at `deadline` (or earlier, if this context does)
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self::build(Some(deadline), &[self])
    }

    /// Derive a child that expires after `timeout`.
    ///
    /// A timeout too large to represent as an instant sets no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.with_cancel(),
        }
    }

    /// Derive a child that can be cancelled independently of this context
    pub fn with_cancel(&self) -> Self {
        Self::build(None, &[self])
    }

    /// Derive a context from several parents: earliest deadline, fires when any parent fires
    pub fn linked<'a>(parents: impl IntoIterator<Item = &'a CallContext>) -> Self {
        let parents: Vec<&CallContext> = parents.into_iter().collect();
        Self::build(None, &parents)
    }

    fn build(deadline: Option<Instant>, parents: &[&CallContext]) -> Self {
        let inherited = parents.iter().filter_map(|p| p.inner.deadline).min();
        let deadline = match (deadline, inherited) {
            (Some(own), Some(inherited)) => Some(own.min(inherited)),
            (own, inherited) => own.or(inherited),
        };
        // A parent with the same deadline already runs a timer that cascades here.
        let needs_timer = match (deadline, inherited) {
            (Some(own), Some(inherited)) => own < inherited,
            (Some(_), None) => true,
            _ => false,
        };

        let (fired, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            deadline,
            fired,
            links: Mutex::new(Links {
                children: Vec::new(),
                callbacks: Vec::new(),
                prune_at: INITIAL_PRUNE_THRESHOLD,
            }),
            timer: Mutex::new(None),
        });

        let mut inherited_signal = None;
        for parent in parents {
            if let Some(signal) = parent.inner.adopt(&inner) {
                inherited_signal.get_or_insert(signal);
            }
        }

        let ctx = Self { inner };
        if let Some(signal) = inherited_signal {
            ctx.inner.fire(signal);
        } else if needs_timer {
            ctx.schedule_deadline();
        }
        ctx
    }

    fn schedule_deadline(&self) {
        let Some(deadline) = self.inner.deadline else {
            return;
        };
        // Without a runtime the deadline is still observed lazily by `signal()`.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(Signal::DeadlineExceeded);
            }
        });
        *lock(&self.inner.timer) = Some(task.abort_handle());
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.inner.fire(Signal::Cancelled);
    }

    /// The signal this context fired with, if any.
    ///
    /// A passed deadline is detected here even when no timer ran.
    pub fn signal(&self) -> Option<Signal> {
        if let Some(signal) = self.inner.current() {
            return Some(signal);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.inner.fire(Signal::DeadlineExceeded);
                self.inner.current()
            }
            _ => None,
        }
    }

    /// Whether the context fired because its deadline passed
    pub fn is_expired(&self) -> bool {
        self.signal() == Some(Signal::DeadlineExceeded)
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == Some(Signal::Cancelled)
    }

    /// Whether the context fired for any reason
    pub fn is_done(&self) -> bool {
        self.signal().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline, saturating at zero
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err` with the matching status once the context has fired
    pub fn check(&self) -> Result<(), Status> {
        match self.signal() {
            Some(signal) => Err(signal.to_status()),
            None => Ok(()),
        }
    }

    /// Run `callback` once when the context fires; immediately if it already has
    pub fn on_signal<F>(&self, callback: F)
    where
        F: FnOnce(Signal) + Send + 'static,
    {
        if let Some(signal) = self.signal() {
            callback(signal);
            return;
        }
        let mut links = lock(&self.inner.links);
        if let Some(signal) = self.inner.current() {
            drop(links);
            callback(signal);
            return;
        }
        links.callbacks.push(Box::new(callback));
    }

    /// Wait until the context fires
    pub async fn signalled(&self) -> Signal {
        let mut rx = self.inner.fired.subscribe();
        loop {
            if let Some(signal) = self.signal() {
                return signal;
            }
            match self.inner.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = rx.changed() => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            self.inner.fire(Signal::DeadlineExceeded);
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        // Unreachable while `self` holds the sender.
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    /// Drive `fut` until it completes or the context fires, whichever comes first
    pub async fn race<F, T>(&self, fut: F) -> Result<T, Status>
    where
        F: Future<Output = T>,
    {
        self.check()?;
        tokio::select! {
            biased;
            signal = self.signalled() => Err(signal.to_status()),
            out = fut => Ok(out),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("deadline", &self.inner.deadline)
            .field("signal", &self.inner.current())
            .finish()
    }
}
