use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    tungstenite::{
        handshake::server::{
            Callback,
            ErrorResponse,
            Request,
            Response,
        },
        http::{
            HeaderValue,
            StatusCode,
            header::SEC_WEBSOCKET_PROTOCOL,
        },
    },
};

use crate::{
    router::{
        acceptor::acceptor::{
            Acceptance,
            Acceptor,
            AcceptorFactory,
        },
        context::RouterContext,
    },
    serializer::binding::BindingRegistry,
};

struct WebSocketSubprotocolNegotiator {
    bindings: BindingRegistry,
    selected_subprotocol: Option<String>,
}

impl WebSocketSubprotocolNegotiator {
    fn new(bindings: BindingRegistry) -> Self {
        Self {
            bindings,
            selected_subprotocol: None,
        }
    }

    fn reject_response<S>(message: S) -> ErrorResponse
    where
        S: Into<String>,
    {
        let mut response = ErrorResponse::new(Some(message.into()));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        response
    }

    fn callback(&mut self) -> impl Callback + use<'_> {
        |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let selected_subprotocol = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|subprotocols| match subprotocols.to_str() {
                    Ok(subprotocols) => subprotocols.split(',').find(|subprotocol| {
                        self.bindings.get(subprotocol.trim()).is_some()
                    }),
                    Err(_) => None,
                });
            let selected_subprotocol = match selected_subprotocol {
                Some(subprotocol) => subprotocol.trim(),
                None => return Err(Self::reject_response("no supported subprotocol")),
            };
            self.selected_subprotocol = Some(selected_subprotocol.to_owned());
            let header = match HeaderValue::from_str(selected_subprotocol) {
                Ok(header) => header,
                Err(_) => return Err(Self::reject_response("failed to create response header")),
            };
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, header);
            Ok(response)
        }
    }
}

#[derive(Default)]
struct WebSocketAcceptor {}

#[async_trait]
impl Acceptor<WebSocketStream<MaybeTlsStream<TcpStream>>> for WebSocketAcceptor {
    async fn accept(
        &self,
        context: &RouterContext<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        stream: MaybeTlsStream<TcpStream>,
    ) -> Result<Acceptance<WebSocketStream<MaybeTlsStream<TcpStream>>>> {
        let mut negotiator =
            WebSocketSubprotocolNegotiator::new(context.router().config().bindings.clone());
        let stream = tokio_tungstenite::accept_hdr_async(stream, negotiator.callback()).await?;
        let subprotocol = match negotiator.selected_subprotocol {
            Some(subprotocol) => subprotocol,
            None => return Err(Error::msg("expected subprotocol after negotiation")),
        };
        let binding = context
            .router()
            .config()
            .bindings
            .get(&subprotocol)
            .ok_or_else(|| Error::msg("negotiated subprotocol has no binding"))?
            .clone();
        Ok(Acceptance { stream, binding })
    }
}

/// A factory for an [`Acceptor`] for WebSocket connections.
#[derive(Default)]
pub struct WebSocketAcceptorFactory {}

impl AcceptorFactory<WebSocketStream<MaybeTlsStream<TcpStream>>> for WebSocketAcceptorFactory {
    fn new_acceptor(&self) -> Box<dyn Acceptor<WebSocketStream<MaybeTlsStream<TcpStream>>> + Send> {
        Box::new(WebSocketAcceptor::default())
    }
}
