//! Concurrency slots.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::sync::OwnedSemaphorePermit;

use crate::metrics;

/// One unit of permission to run against a model instance.
///
/// Released when dropped, whether the run finished, failed or was abandoned.
#[derive(Debug)]
pub struct SlotGuard {
    model_id: String,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    pub(crate) fn new(model_id: &str, permit: OwnedSemaphorePermit) -> Self {
        metrics::inc_active_runs(model_id);
        Self {
            model_id: model_id.to_string(),
            _permit: permit,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Share the slot. It is released when the last lease is dropped.
    pub fn into_lease(self) -> SlotLease {
        SlotLease(Arc::new(self))
    }
}

/// Shared hold on a slot. Clones go wherever work for the run may still be
/// executing (pool jobs, stream producers) so the slot outlives all of it.
#[derive(Debug, Clone)]
pub struct SlotLease(Arc<SlotGuard>);

impl SlotLease {
    pub fn model_id(&self) -> &str {
        self.0.model_id()
    }

    /// Tie one share of the slot to a stream.
    pub fn hold<S: Stream>(&self, inner: S) -> Guarded<S> {
        Guarded {
            inner,
            lease: self.clone(),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        metrics::dec_active_runs(&self.model_id);
    }
}

pin_project! {
    /// A stream that holds a share of a concurrency slot for as long as it
    /// lives.
    pub struct Guarded<S> {
        #[pin]
        inner: S,
        lease: SlotLease,
    }
}

impl<S> Guarded<S> {
    pub fn model_id(&self) -> &str {
        self.lease.model_id()
    }
}

impl<S: Stream> Stream for Guarded<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
