//! Producer-side handoff of new content.
//!
//! A producer (a local edit or a remote generation request) pushes finished
//! content through a [`ContentPublisher`]; the scheduler drains the matching
//! [`ContentFeed`] at its next tick. Requests carry an explicit cancellation
//! token: starting a new request supersedes every older one, and a superseded
//! request's result is refused at completion and again when drained.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};

use crate::error::{ConflictKind, Error, Result};
use crate::events::Content;

/// Content tagged with the request that produced it.
#[derive(Clone, Debug)]
pub struct ContentUpdate {
    pub request: u64,
    pub content: Content,
}

/// Cancellation token for one in-flight content request.
#[derive(Clone, Debug)]
pub struct ContentRequest {
    id: u64,
    latest: Arc<AtomicU64>,
}

impl ContentRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once a newer request has been started or this one was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.latest.load(Ordering::Acquire) != self.id
    }

    /// Withdraw this request without starting a new one.
    pub fn cancel(&self) {
        // only the newest request can still be live
        let _ = self.latest.compare_exchange(
            self.id,
            u64::MAX,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Producer end of the content channel.
#[derive(Clone, Debug)]
pub struct ContentPublisher {
    tx: Sender<ContentUpdate>,
    latest: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
}

/// Scheduler end of the content channel.
#[derive(Debug)]
pub struct ContentFeed {
    rx: Receiver<ContentUpdate>,
    latest: Arc<AtomicU64>,
}

/// Create a connected publisher/feed pair.
pub fn content_channel() -> (ContentPublisher, ContentFeed) {
    let (tx, rx) = unbounded();
    let latest = Arc::new(AtomicU64::new(0));
    (
        ContentPublisher {
            tx,
            latest: latest.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
        },
        ContentFeed { rx, latest },
    )
}

impl ContentPublisher {
    /// Start a new request, cancelling every older one.
    pub fn begin_request(&self) -> ContentRequest {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let previous = self.latest.swap(id, Ordering::AcqRel);
        if previous != 0 && previous != u64::MAX {
            log::debug!("[CONTENT] Request {} supersedes request {}", id, previous);
        }
        ContentRequest {
            id,
            latest: self.latest.clone(),
        }
    }

    /// Deliver the result of `request`.
    ///
    /// Invalid content is returned to the producer untouched. A request that
    /// was superseded in the meantime is refused with a scheduling conflict.
    pub fn complete(&self, request: &ContentRequest, content: Content) -> Result<()> {
        content.validate()?;
        if request.is_cancelled() {
            let latest = self.latest.load(Ordering::Acquire);
            log::debug!(
                "[CONTENT] Discarding result of request {} (latest {})",
                request.id,
                latest
            );
            return Err(Error::SchedulingConflict(ConflictKind::Superseded {
                request: request.id,
                latest,
            }));
        }
        self.push(ContentUpdate {
            request: request.id,
            content,
        });
        Ok(())
    }

    /// Push content that needs no round-trip (e.g. a local edit).
    ///
    /// This counts as the newest request, so anything still in flight is
    /// superseded.
    pub fn content_changed(&self, content: Content) -> Result<()> {
        content.validate()?;
        let request = self.begin_request();
        self.push(ContentUpdate {
            request: request.id,
            content,
        });
        Ok(())
    }

    fn push(&self, update: ContentUpdate) {
        let request = update.request;
        match self.tx.try_send(update) {
            Ok(()) => log::trace!("[CONTENT] Queued content of request {}", request),
            Err(TrySendError::Disconnected(_)) | Err(TrySendError::Full(_)) => {
                log::warn!("[CONTENT] Feed closed, dropping content of request {}", request)
            }
        }
    }
}

impl ContentFeed {
    /// Take every queued update and return only the freshest one that is
    /// still current.
    pub fn drain_latest(&self) -> Option<ContentUpdate> {
        let latest = self.latest.load(Ordering::Acquire);
        let mut freshest: Option<ContentUpdate> = None;
        for update in self.rx.try_iter() {
            if update.request != latest {
                log::debug!("[CONTENT] Dropping stale content of request {}", update.request);
                continue;
            }
            freshest = Some(update);
        }
        freshest
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
