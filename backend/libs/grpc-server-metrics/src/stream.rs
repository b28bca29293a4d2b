//! Server-side message streams
//!
//! [`ServerStream`] is the capability a streaming handler works against.
//! [`MonitoredServerStream`] decorates any implementation and counts the
//! messages that actually cross the boundary; [`TonicServerStream`] adapts a
//! tonic request stream plus a response channel.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::metadata::MetadataMap;
use tonic::{Extensions, Request, Status, Streaming};

use crate::reporter::MessageCounters;

/// Bidirectional message stream of one server-side call
#[async_trait]
pub trait ServerStream: Send {
    /// Messages read from the client
    type Inbound: Send;
    /// Messages written to the client
    type Outbound: Send;
    type Error: Send;

    /// Send one message to the client
    async fn send_msg(&mut self, msg: Self::Outbound) -> Result<(), Self::Error>;

    /// Receive the next client message, `Ok(None)` once the client half-closes
    async fn recv_msg(&mut self) -> Result<Option<Self::Inbound>, Self::Error>;

    /// Metadata the client sent with the call
    fn metadata(&self) -> &MetadataMap;

    /// Request extensions set by earlier layers
    fn extensions(&self) -> &Extensions;
}

/// Decorator counting successful sends and receives.
///
/// Failed operations and the end-of-stream marker are passed through without
/// being counted. Payloads and errors are never altered.
pub struct MonitoredServerStream<S> {
    inner: S,
    counters: MessageCounters,
}

impl<S> MonitoredServerStream<S> {
    pub fn new(inner: S, counters: MessageCounters) -> Self {
        Self { inner, counters }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: ServerStream> ServerStream for MonitoredServerStream<S> {
    type Inbound = S::Inbound;
    type Outbound = S::Outbound;
    type Error = S::Error;

    async fn send_msg(&mut self, msg: Self::Outbound) -> Result<(), Self::Error> {
        self.inner.send_msg(msg).await?;
        self.counters.sent_message();
        Ok(())
    }

    async fn recv_msg(&mut self) -> Result<Option<Self::Inbound>, Self::Error> {
        let msg = self.inner.recv_msg().await?;
        if msg.is_some() {
            self.counters.received_message();
        }
        Ok(msg)
    }

    fn metadata(&self) -> &MetadataMap {
        self.inner.metadata()
    }

    fn extensions(&self) -> &Extensions {
        self.inner.extensions()
    }
}

/// [`ServerStream`] over a tonic request stream and a response channel.
///
/// The receiving half of the channel is what the tonic service method
/// returns, usually wrapped in `tokio_stream::wrappers::ReceiverStream`.
pub struct TonicServerStream<Req, Resp> {
    metadata: MetadataMap,
    extensions: Extensions,
    inbound: Streaming<Req>,
    outbound: mpsc::Sender<Result<Resp, Status>>,
}

impl<Req, Resp> TonicServerStream<Req, Resp> {
    pub fn new(
        request: Request<Streaming<Req>>,
        outbound: mpsc::Sender<Result<Resp, Status>>,
    ) -> Self {
        let (metadata, extensions, inbound) = request.into_parts();
        Self {
            metadata,
            extensions,
            inbound,
            outbound,
        }
    }
}

#[async_trait]
impl<Req, Resp> ServerStream for TonicServerStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Inbound = Req;
    type Outbound = Resp;
    type Error = Status;

    async fn send_msg(&mut self, msg: Resp) -> Result<(), Status> {
        self.outbound
            .send(Ok(msg))
            .await
            .map_err(|_| Status::cancelled("client stream closed"))
    }

    async fn recv_msg(&mut self) -> Result<Option<Req>, Status> {
        self.inbound.message().await
    }

    fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    fn extensions(&self) -> &Extensions {
        &self.extensions
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockStream;
    use super::*;
    use crate::config::ServerMetricsConfig;
    use crate::labels::{CallShape, MethodIdentity};
    use crate::registry::{MetricRegistry, SeriesId};
    use crate::reporter::CallReporter;
    use bytes::Bytes;
    use http_body_util::Full;
    use prost::Message;
    use tonic::codec::{Codec, ProstCodec};
    use tonic::Code;

    /// Tonic stream whose request body carries `messages`, plus the receiver
    /// a service method would hand back to tonic
    fn tonic_stream(
        messages: &[&str],
    ) -> (
        TonicServerStream<String, String>,
        mpsc::Receiver<Result<String, Status>>,
    ) {
        let mut body = Vec::new();
        for msg in messages {
            let payload = msg.to_string().encode_to_vec();
            body.push(0u8);
            body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            body.extend_from_slice(&payload);
        }

        let decoder = ProstCodec::<String, String>::default().decoder();
        let body = Full::new(Bytes::from(body));
        let streaming = Streaming::new_request(decoder, body, None, None);
        let mut request = Request::new(streaming);
        request
            .metadata_mut()
            .insert("x-request-id", "req-1".parse().unwrap());

        let (tx, rx) = mpsc::channel(4);
        (TonicServerStream::new(request, tx), rx)
    }

    #[tokio::test]
    async fn test_monitored_stream_counts_only_successes() {
        let registry = MetricRegistry::new(&ServerMetricsConfig::default()).unwrap();
        let identity = MethodIdentity::new("pkg.Chat", "Sync");
        let shape = CallShape::BidiStream;
        let reporter = CallReporter::new(registry.clone(), shape, identity.clone());

        let mut mock = MockStream::new(vec![
            Ok("a".to_string()),
            Err(Status::data_loss("corrupt frame")),
            Ok("b".to_string()),
        ]);
        mock.fail_sends_after = Some(1);
        let mut stream = MonitoredServerStream::new(mock, reporter.message_counters());

        assert_eq!(stream.recv_msg().await.unwrap(), Some("a".to_string()));
        assert_eq!(stream.recv_msg().await.unwrap_err().code(), Code::DataLoss);
        assert_eq!(stream.recv_msg().await.unwrap(), Some("b".to_string()));
        assert_eq!(stream.recv_msg().await.unwrap(), None);

        assert!(stream.send_msg("x".to_string()).await.is_ok());
        assert_eq!(
            stream.send_msg("y".to_string()).await.unwrap_err().code(),
            Code::Unavailable
        );
        reporter.handled(Code::Ok);

        assert_eq!(stream.get_ref().sent, vec!["x".to_string()]);
        assert_eq!(
            registry.counter_value(&SeriesId::msg_received(shape, &identity)),
            Some(2)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::msg_sent(shape, &identity)),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_monitored_stream_delegates_metadata() {
        let registry = MetricRegistry::new(&ServerMetricsConfig::default()).unwrap();
        let reporter = CallReporter::new(
            registry,
            CallShape::ServerStream,
            MethodIdentity::new("pkg.Feed", "Watch"),
        );

        let mut mock = MockStream::new(vec![]);
        mock.metadata.insert("x-request-id", "abc".parse().unwrap());
        mock.extensions.insert(7_u32);
        let stream = MonitoredServerStream::new(mock, reporter.message_counters());

        assert_eq!(
            stream.metadata().get("x-request-id").unwrap().to_str().unwrap(),
            "abc"
        );
        assert_eq!(stream.extensions().get::<u32>(), Some(&7));
        reporter.handled(Code::Ok);
    }

    #[tokio::test]
    async fn test_tonic_stream_reads_requests_and_forwards_responses() {
        let (mut stream, mut rx) = tonic_stream(&["ping", "pong"]);

        let request_id = stream.metadata().get("x-request-id").unwrap();
        assert_eq!(request_id.to_str().unwrap(), "req-1");
        assert_eq!(stream.recv_msg().await.unwrap().as_deref(), Some("ping"));
        assert_eq!(stream.recv_msg().await.unwrap().as_deref(), Some("pong"));
        assert_eq!(stream.recv_msg().await.unwrap(), None);

        stream.send_msg("ack".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), "ack");
    }

    #[tokio::test]
    async fn test_tonic_stream_closed_client_is_cancelled_and_not_counted() {
        let registry = MetricRegistry::new(&ServerMetricsConfig::default()).unwrap();
        let identity = MethodIdentity::new("pkg.Feed", "Watch");
        let shape = CallShape::ServerStream;
        let reporter = CallReporter::new(registry.clone(), shape, identity.clone());

        let (inner, rx) = tonic_stream(&[]);
        drop(rx);
        let mut stream = MonitoredServerStream::new(inner, reporter.message_counters());

        let err = stream.send_msg("late".to_string()).await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        reporter.handled(err.code());

        let sent = SeriesId::msg_sent(shape, &identity);
        assert_eq!(registry.counter_value(&sent), Some(0));
        assert_eq!(
            registry.counter_value(&SeriesId::handled(shape, &identity, "Canceled")),
            Some(1)
        );
    }
}
