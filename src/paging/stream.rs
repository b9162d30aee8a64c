//! Lazy page stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Page, PageQuery, Paginator, StreamCursor};
use crate::error::Result;

/// Lifecycle of a [`PageStream`].
///
/// `Initial -> Fetching -> (Yielded -> Fetching)* -> Done`. `Cancelled` is
/// entered when cancellation is observed, `Failed` when a page fetch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
  Initial,
  Fetching,
  Yielded,
  Done,
  Cancelled,
  Failed,
}

impl StreamState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Done | Self::Cancelled | Self::Failed)
  }
}

/// Stream of pages of one query, yielded in order until the last page.
///
/// Cancellation is checked before each page fetch and again when a fetch
/// completes; a page that was in flight when the token fired is dropped.
pub struct PageStream {
  paginator: Paginator,
  query: PageQuery,
  cancel: CancellationToken,
  state: StreamState,
  next: Option<StreamCursor>,
  in_flight: Option<BoxFuture<'static, Result<Arc<Page>>>>,
}

impl PageStream {
  pub(crate) fn new(paginator: Paginator, query: PageQuery, cancel: CancellationToken) -> Self {
    Self {
      paginator,
      query,
      cancel,
      state: StreamState::Initial,
      next: None,
      in_flight: None,
    }
  }

  pub fn state(&self) -> StreamState {
    self.state
  }

  pub fn query(&self) -> &PageQuery {
    &self.query
  }

  fn finish(&mut self, state: StreamState) {
    debug!(owner = %self.query.owner, kind = %self.query.kind, ?state, "page stream finished");
    self.state = state;
    self.next = None;
    self.in_flight = None;
    self.paginator.release(&self.query);
  }

  fn start_fetch(&mut self, after: Option<StreamCursor>) {
    let paginator = self.paginator.clone();
    let query = self.query.clone();
    let fetch = async move {
      match after {
        Some(cursor) => paginator.get_next_page(&query, &cursor).await,
        None => paginator.get_initial_page(&query).await,
      }
    };
    self.in_flight = Some(fetch.boxed());
    self.state = StreamState::Fetching;
  }
}

impl Stream for PageStream {
  type Item = Result<Arc<Page>>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = &mut *self;
    loop {
      if this.state.is_terminal() {
        return Poll::Ready(None);
      }

      if this.state == StreamState::Fetching {
        let Some(fetch) = this.in_flight.as_mut() else {
          this.finish(StreamState::Done);
          return Poll::Ready(None);
        };
        let result = match fetch.poll_unpin(cx) {
          Poll::Ready(result) => result,
          Poll::Pending => return Poll::Pending,
        };
        this.in_flight = None;

        if this.cancel.is_cancelled() {
          this.finish(StreamState::Cancelled);
          return Poll::Ready(None);
        }

        return match result {
          Ok(page) => {
            if page.has_more && page.cursor.is_some() {
              this.next = page.cursor.clone();
              this.state = StreamState::Yielded;
            } else {
              this.finish(StreamState::Done);
            }
            Poll::Ready(Some(Ok(page)))
          }
          Err(err) => {
            this.finish(StreamState::Failed);
            Poll::Ready(Some(Err(err)))
          }
        };
      }

      // Initial or Yielded: start the next fetch unless cancelled
      if this.cancel.is_cancelled() {
        this.finish(StreamState::Cancelled);
        return Poll::Ready(None);
      }
      if this.state == StreamState::Initial {
        this.start_fetch(None);
      } else {
        match this.next.take() {
          Some(cursor) => this.start_fetch(Some(cursor)),
          None => {
            this.finish(StreamState::Done);
            return Poll::Ready(None);
          }
        }
      }
    }
  }
}
