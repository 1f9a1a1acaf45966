use std::{
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
};

use crate::{
    message::message::Message,
    serializer::serializer::Serializer,
    transport::transport::{
        Transport,
        TransportData,
    },
};

/// A message passing through a [`MessageStream`].
pub enum StreamMessage {
    /// A health check that should be echoed back to the sender.
    Ping(Vec<u8>),
    /// A WAMP message.
    Message(Message),
}

/// The type of connection a peer is communicating over.
#[derive(Debug, Clone)]
pub enum ConnectionType {
    /// Connection to a remote address.
    Remote(String),
    /// Direct, in-process connection.
    Direct,
}

/// A bidirectional, lazy stream of WAMP messages.
///
/// The stream terminates on close. Sending enqueues a message on the underlying carrier; it does
/// not wait for the peer to receive it.
pub trait MessageStream:
    Send + Unpin + Stream<Item = Result<StreamMessage>> + Sink<StreamMessage, Error = Error>
{
    /// The type of stream, mostly for logging.
    fn message_stream_type(&self) -> &'static str;

    /// The type of connection the stream communicates over.
    fn connection_type(&self) -> ConnectionType;
}

/// A [`MessageStream`] over a framed [`Transport`], using a [`Serializer`] for the byte
/// representation of each message.
pub struct TransportMessageStream {
    transport: Box<dyn Transport>,
    serializer: Box<dyn Serializer>,
    remote_addr: String,
}

impl TransportMessageStream {
    pub fn new(
        transport: Box<dyn Transport>,
        serializer: Box<dyn Serializer>,
        remote_addr: String,
    ) -> Self {
        Self {
            transport,
            serializer,
            remote_addr,
        }
    }
}

impl MessageStream for TransportMessageStream {
    fn message_stream_type(&self) -> &'static str {
        "transport"
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Remote(self.remote_addr.clone())
    }
}

impl Stream for TransportMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.transport.poll_next_unpin(cx)) {
            Some(Ok(TransportData::Ping(data))) => {
                task::Poll::Ready(Some(Ok(StreamMessage::Ping(data))))
            }
            Some(Ok(TransportData::Message(data))) => {
                let message = self.serializer.deserialize(&data)?;
                task::Poll::Ready(Some(Ok(StreamMessage::Message(message))))
            }
            Some(Err(err)) => task::Poll::Ready(Some(Err(err))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<StreamMessage> for TransportMessageStream {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_ready_unpin(cx)
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        item: StreamMessage,
    ) -> std::result::Result<(), Self::Error> {
        let data = match item {
            StreamMessage::Ping(data) => TransportData::Ping(data),
            StreamMessage::Message(message) => {
                TransportData::Message(self.serializer.serialize(&message)?)
            }
        };
        self.transport.start_send_unpin(data)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_flush_unpin(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_close_unpin(cx)
    }
}

/// A [`MessageStream`] over a pair of in-process channels, for peers living in the same process as
/// the router.
pub struct DirectMessageStream {
    message_tx: UnboundedSender<Message>,
    message_rx: UnboundedReceiver<Message>,
}

impl DirectMessageStream {
    pub fn new(message_tx: UnboundedSender<Message>, message_rx: UnboundedReceiver<Message>) -> Self {
        Self {
            message_tx,
            message_rx,
        }
    }
}

impl MessageStream for DirectMessageStream {
    fn message_stream_type(&self) -> &'static str {
        "direct"
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Direct
    }
}

impl Stream for DirectMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.message_rx.poll_recv(cx)) {
            Some(message) => task::Poll::Ready(Some(Ok(StreamMessage::Message(message)))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<StreamMessage> for DirectMessageStream {
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn start_send(
        self: Pin<&mut Self>,
        item: StreamMessage,
    ) -> std::result::Result<(), Self::Error> {
        match item {
            // There is no transport to health check.
            StreamMessage::Ping(_) => Ok(()),
            StreamMessage::Message(message) => self
                .message_tx
                .send(message)
                .map_err(|_| Error::msg("direct stream closed")),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.message_rx.close();
        task::Poll::Ready(Ok(()))
    }
}
