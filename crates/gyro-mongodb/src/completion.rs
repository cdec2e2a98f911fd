//! Completion handlers for deferred operation results
//!
//! Every operation returns a future. A caller that also wants a callback
//! attaches one with [`Deferred::on_complete`] (or [`Deferred::with_handler`]
//! when the handler is optional). Both paths go through [`settle`], so the
//! handler always sees exactly the outcome the future resolves to, and sees it
//! right before the future yields it.
//!
//! ```rust,ignore
//! let docs = mongo
//!     .find("users", doc! { "active": true }, None)
//!     .on_complete(|outcome| match outcome {
//!         Ok(docs) => tracing::info!(count = docs.len(), "loaded users"),
//!         Err(err) => tracing::warn!(error = %err, "failed to load users"),
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::Result;

/// Deliver `outcome` to `handler` (if any) and hand it back unchanged
pub fn settle<T, H>(outcome: Result<T>, handler: Option<H>) -> Result<T>
where
    H: FnOnce(&Result<T>),
{
    if let Some(handler) = handler {
        handler(&outcome);
    }
    outcome
}

/// Future returned by [`Deferred::on_complete`] and [`Deferred::with_handler`]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Completion<F, H> {
    future: Pin<Box<F>>,
    handler: Option<H>,
}

// The handler is never pinned; it is only moved out once the inner future is done.
impl<F, H> Unpin for Completion<F, H> {}

impl<T, F, H> Future for Completion<F, H>
where
    F: Future<Output = Result<T>>,
    H: FnOnce(&Result<T>),
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.future.as_mut().poll(cx) {
            Poll::Ready(outcome) => Poll::Ready(settle(outcome, this.handler.take())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Attach a completion handler to any operation future
pub trait Deferred<T>: Future<Output = Result<T>> + Sized {
    /// Invoke `handler` once with the outcome, then resolve to the same outcome
    fn on_complete<H>(self, handler: H) -> Completion<Self, H>
    where
        H: FnOnce(&Result<T>),
    {
        self.with_handler(Some(handler))
    }

    /// Like [`Deferred::on_complete`], but a `None` handler is a no-op
    fn with_handler<H>(self, handler: Option<H>) -> Completion<Self, H>
    where
        H: FnOnce(&Result<T>),
    {
        Completion {
            future: Box::pin(self),
            handler,
        }
    }
}

impl<T, F> Deferred<T> for F where F: Future<Output = Result<T>> {}
