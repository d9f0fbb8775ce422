//! Pass-through body wrapper that keeps a bounded prefix for auditing.
//!
//! Frames are forwarded as soon as the inner body yields them. Only the
//! first `limit` bytes are copied; memory per body never exceeds the limit.
//! The capture is finished exactly once: at end of stream, on a body error,
//! or when the body is dropped.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use http_body::{Body as HttpBody, Frame, SizeHint};

/// What a [`CaptureBody`] saw of its stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    /// Retained prefix, at most `limit` bytes.
    pub bytes: Vec<u8>,
    /// More bytes streamed than the limit allowed.
    pub cut: bool,
    /// The stream reached its end without error.
    pub complete: bool,
}

impl Captured {
    fn record(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.cut = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Body for the audit snapshot and whether it is partial.
    ///
    /// A partial capture (cut, failed or abandoned) yields no body.
    pub fn into_snapshot(self) -> (Option<Vec<u8>>, bool) {
        if self.complete && !self.cut {
            (Some(self.bytes), false)
        } else {
            (None, true)
        }
    }
}

/// Capture shared between a body and whoever reads it afterwards.
#[derive(Debug, Clone, Default)]
pub struct SharedCapture(Arc<Mutex<Captured>>);

impl SharedCapture {
    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state of the capture.
    pub fn snapshot(&self) -> Captured {
        self.lock().clone()
    }
}

type OnFinish = Box<dyn FnOnce(Captured) + Send + 'static>;

/// Body wrapper forwarding frames while copying a bounded prefix.
pub struct CaptureBody {
    inner: Body,
    limit: usize,
    capture: SharedCapture,
    on_finish: Option<OnFinish>,
    finished: bool,
}

impl CaptureBody {
    /// Wrap `inner`, recording into `capture`.
    pub fn new(inner: Body, limit: usize, capture: SharedCapture) -> Self {
        Self {
            inner,
            limit,
            capture,
            on_finish: None,
            finished: false,
        }
    }

    /// Run `on_finish` with the final capture once the stream is over.
    pub fn on_finish(mut self, on_finish: impl FnOnce(Captured) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(on_finish));
        self
    }

    /// Convert into an axum [`Body`].
    pub fn into_body(self) -> Body {
        Body::new(self)
    }

    fn finish(&mut self, complete: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        let captured = {
            let mut capture = self.capture.lock();
            capture.complete = complete;
            capture.clone()
        };
        if let Some(on_finish) = self.on_finish.take() {
            on_finish(captured);
        }
    }
}

impl HttpBody for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.lock().record(data, this.limit);
                }
            }
            Poll::Ready(Some(Err(_))) => this.finish(false),
            Poll::Ready(None) => this.finish(true),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        // Servers may drop a body once it reports end of stream.
        let complete = self.inner.is_end_stream();
        self.finish(complete);
    }
}
