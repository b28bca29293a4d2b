//! HTTP bodies that count gRPC messages as they pass through
//!
//! A gRPC message on the wire is a 5 byte prefix (compression flag plus a
//! big-endian u32 length) followed by the payload. Messages may be split
//! across data frames or share one, so counting tracks the prefix across
//! frame boundaries and only counts a message once its last byte passed.

use std::borrow::Cow;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tonic::Code;

use crate::labels::{code_label, status_label_from_header};
use crate::reporter::{CallReporter, MessageCounters};

const PREFIX_LEN: usize = 5;

/// Incremental parser for length-prefixed gRPC messages
#[derive(Debug, Default)]
pub(crate) struct FrameCounter {
    prefix: [u8; PREFIX_LEN],
    prefix_len: usize,
    remaining: usize,
}

impl FrameCounter {
    /// Consume `bytes`, returning how many messages they completed
    pub(crate) fn feed(&mut self, mut bytes: &[u8]) -> u64 {
        let mut completed = 0;

        while !bytes.is_empty() {
            if self.prefix_len < PREFIX_LEN {
                let take = (PREFIX_LEN - self.prefix_len).min(bytes.len());
                self.prefix[self.prefix_len..self.prefix_len + take]
                    .copy_from_slice(&bytes[..take]);
                self.prefix_len += take;
                bytes = &bytes[take..];

                if self.prefix_len == PREFIX_LEN {
                    let len = u32::from_be_bytes([
                        self.prefix[1],
                        self.prefix[2],
                        self.prefix[3],
                        self.prefix[4],
                    ]);
                    self.remaining = len as usize;
                    if self.remaining == 0 {
                        completed += 1;
                        self.prefix_len = 0;
                    }
                }
                continue;
            }

            let take = self.remaining.min(bytes.len());
            self.remaining -= take;
            bytes = &bytes[take..];

            if self.remaining == 0 {
                completed += 1;
                self.prefix_len = 0;
            }
        }

        completed
    }
}

/// Request body counting messages received from the client
#[pin_project]
pub struct InboundBody<B> {
    #[pin]
    inner: B,
    frames: FrameCounter,
    counters: MessageCounters,
}

impl<B> InboundBody<B> {
    pub(crate) fn new(inner: B, counters: MessageCounters) -> Self {
        Self {
            inner,
            frames: FrameCounter::default(),
            counters,
        }
    }
}

impl<B> Body for InboundBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));

        if let Some(Ok(frame)) = &frame {
            if let Some(data) = frame.data_ref() {
                this.counters.received_messages(this.frames.feed(data));
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Response body counting messages sent to the client.
///
/// Owns the call's reporter until the trailers carrying `grpc-status` pass
/// through. If the body is dropped first the reporter records the call as
/// cancelled. Calls the layer does not instrument carry no counters and
/// pass through untouched.
#[pin_project]
pub struct OutboundBody<B> {
    #[pin]
    inner: B,
    frames: FrameCounter,
    counters: Option<MessageCounters>,
    reporter: Option<CallReporter>,
}

impl<B> OutboundBody<B> {
    pub(crate) fn new(
        inner: B,
        counters: Option<MessageCounters>,
        reporter: Option<CallReporter>,
    ) -> Self {
        Self {
            inner,
            frames: FrameCounter::default(),
            counters,
            reporter,
        }
    }
}

fn finish(reporter: &mut Option<CallReporter>, label: &str) {
    if let Some(reporter) = reporter.take() {
        reporter.handled_with_label(label);
    }
}

/// Status label carried by a header or trailer map, if any
pub(crate) fn grpc_status(headers: &HeaderMap) -> Option<Cow<'static, str>> {
    headers
        .get("grpc-status")
        .map(|value| status_label_from_header(value.as_bytes()))
}

impl<B> Body for OutboundBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));

        let Some(counters) = this.counters.as_ref() else {
            return Poll::Ready(frame);
        };

        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    counters.sent_messages(this.frames.feed(data));
                } else if let Some(trailers) = frame.trailers_ref() {
                    let label = grpc_status(trailers)
                        .unwrap_or(Cow::Borrowed(code_label(Code::Unknown)));
                    finish(this.reporter, &label);
                }
            }
            Some(Err(_)) => finish(this.reporter, code_label(Code::Unknown)),
            // Ended without trailers
            None => finish(this.reporter, code_label(Code::Unknown)),
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
