//! Ingress agent ("Pollux"): the tunnel's client side.
//!
//! Accepts arbitrary inbound HTTP requests, fragments them, enciphers every
//! fragment under a per-session secret, and drives the five-step tunnel
//! exchange against the egress agent. The reconstructed response is streamed
//! back to the original caller as it arrives.

use std::{io, pin::pin, time::Duration};

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode, request::Parts};
use http_body_util::{BodyExt, StreamBody};
use hyper::{
    Request, Response,
    body::{Frame, Incoming},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use n0_error::{AnyError, Result, StdResultExt, anyerr, stack_error};
use n0_future::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};
use url::Url;

use crate::{
    cipher::TunnelCipher,
    egress::DEFAULT_CHUNK_SIZE,
    util::{HyperBody, body_to_stream, chunk_stream, empty_response, retry},
    wire::{
        ADD_BODY_PATH, ADD_HEADER_PATH, CREATE_SESSION_PATH, EXECUTE_PATH, MetaReply,
        RESPONSE_META_PATH, SESSION_TOKEN_HEADER, SessionReply,
    },
};

/// Retry policy for tunnel calls racing session visibility: the session
/// created one beat earlier may not be readable at the egress side yet.
const SESSION_RETRY_ATTEMPTS: usize = 6;
const SESSION_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Hop-by-hop headers, never forwarded to the original caller (RFC 9110).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error from one tunnel exchange.
#[stack_error(add_meta, derive)]
pub struct ExchangeError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl ExchangeError {
    /// Status code to surface to the original caller, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    fn is_not_found(&self) -> bool {
        self.response_status == Some(StatusCode::NOT_FOUND)
    }

    fn not_found(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::NOT_FOUND), source.into())
    }

    fn bad_gateway(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_GATEWAY), source.into())
    }

    fn bad_request(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_REQUEST), source.into())
    }
}

/// The ingress proxy agent.
///
/// One instance drives any number of concurrent exchanges; each inbound
/// request gets its own session, secret, and cipher.
#[derive(derive_more::Debug, Clone)]
pub struct IngressProxy {
    egress_base: String,
    #[debug(skip)]
    master: TunnelCipher,
    http_client: reqwest::Client,
    chunk_size: usize,
    target_base: Option<Url>,
}

impl IngressProxy {
    /// Creates an ingress proxy talking to the egress agent at `egress_base`,
    /// keyed by the shared master key.
    pub fn new(egress_base: impl Into<String>, master_key: &str) -> Self {
        let mut egress_base = egress_base.into();
        while egress_base.ends_with('/') {
            egress_base.pop();
        }
        Self {
            egress_base,
            master: TunnelCipher::new(master_key),
            http_client: reqwest::Client::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            target_base: None,
        }
    }

    /// Overrides the inbound body frame size (default [`DEFAULT_CHUNK_SIZE`]).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Reverse-proxy mode: rewrite every inbound request target onto `base`
    /// instead of deriving the target from the request itself.
    pub fn with_target_base(mut self, base: Url) -> Self {
        self.target_base = Some(base);
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.egress_base, path)
    }

    /// Accepts caller connections on `listener` and forwards each request
    /// through the tunnel in its own task.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut id = 0;
        loop {
            let (stream, peer_addr) = listener.accept().await.anyerr()?;
            let this = self.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%peer_addr, "accepted caller connection");
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let this = this.clone();
                            async move {
                                Ok::<_, std::convert::Infallible>(this.handle(req).await)
                            }
                        });
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            warn!("failed to serve caller connection: {err:#}");
                        }
                    })
                    .instrument(error_span!("ingress-conn", id)),
            );
            id += 1;
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<HyperBody> {
        match self.forward(req).await {
            Ok(res) => res,
            Err(err) => {
                let status = err.response_status().unwrap_or(StatusCode::BAD_GATEWAY);
                warn!(%status, "failed to forward request: {err:#}");
                empty_response(status)
            }
        }
    }

    /// Drives one full tunnel exchange for one inbound request.
    async fn forward(&self, req: Request<Incoming>) -> Result<Response<HyperBody>, ExchangeError> {
        let (parts, body) = req.into_parts();
        debug!(method = %parts.method, uri = %parts.uri, "incoming request");
        let target = self.target_url(&parts)?;

        // Handshake: create the session, unwrap its secret under the master
        // key. The token is the capability for every call below.
        let hello: SessionReply = self
            .http_client
            .get(self.endpoint(CREATE_SESSION_PATH))
            .send()
            .await
            .map_err(|err| ExchangeError::bad_gateway(anyerr!(err)))?
            .json()
            .await
            .map_err(|err| ExchangeError::bad_gateway(anyerr!(err)))?;
        let secret = self
            .master
            .with_fresh_cursor()
            .decrypt_str(&hello.data)
            .map_err(|err| ExchangeError::bad_gateway(anyerr!(err)))?;
        let token = hello.token;
        debug!(%token, "tunnel session created");
        let cipher = TunnelCipher::new(&secret);

        // Headers, one call per header, each field from a fresh cursor.
        for (name, value) in &parts.headers {
            let name = name.as_str();
            if name.starts_with("x-forwarded-") || name == "accept-encoding" {
                continue;
            }
            let x = cipher.with_fresh_cursor().encrypt_str(name);
            let y = cipher.with_fresh_cursor().encrypt(value.as_bytes());
            self.tunnel_call(ADD_HEADER_PATH, &token, &[("x", x.as_str()), ("y", y.as_str())])
                .await?;
        }

        // Body, re-chunked into fixed frames with strictly increasing indexes.
        let mut frames = pin!(chunk_stream(body_to_stream(body), self.chunk_size));
        let mut index = 0u64;
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(|err| ExchangeError::bad_gateway(anyerr!(err)))?;
            let chunk = cipher.with_fresh_cursor().encrypt(&frame);
            let index_str = index.to_string();
            self.tunnel_call(
                ADD_BODY_PATH,
                &token,
                &[("i", index_str.as_str()), ("j", chunk.as_str())],
            )
            .await?;
            index += 1;
        }

        // Execute: the egress side performs the real request and starts
        // streaming the obfuscated response body.
        let m = cipher.with_fresh_cursor().encrypt_str(parts.method.as_str());
        let n = cipher.with_fresh_cursor().encrypt_str(&target);
        let (m, n, token_str) = (m.as_str(), n.as_str(), token.as_str());
        let wire_response = retry(
            SESSION_RETRY_ATTEMPTS,
            SESSION_RETRY_DELAY,
            ExchangeError::is_not_found,
            || async move {
                let res = self
                    .http_client
                    .get(self.endpoint(EXECUTE_PATH))
                    .header(SESSION_TOKEN_HEADER, token_str)
                    .query(&[("m", m), ("n", n)])
                    .send()
                    .await
                    .map_err(|err| ExchangeError::bad_gateway(anyerr!(err)))?;
                check_wire_status(res.status())?;
                Ok(res)
            },
        )
        .await?;

        // Metadata storage may race the first body bytes; poll briefly and
        // fall back to a bare 200 if it never materializes.
        let (status, headers) = self.fetch_meta(&token, &cipher).await;

        let mut res = Response::new(deciphered_body(wire_response, cipher, self.chunk_size));
        *res.status_mut() = status;
        for (name, value) in headers {
            if HOP_BY_HOP_HEADERS.contains(&name.as_str()) || name == http::header::CONTENT_LENGTH
            {
                continue;
            }
            res.headers_mut().append(name, value);
        }
        Ok(res)
    }

    /// One acknowledged tunnel call, retried while the session is not yet
    /// visible at the egress side.
    async fn tunnel_call(
        &self,
        path: &str,
        token: &str,
        params: &[(&str, &str)],
    ) -> Result<(), ExchangeError> {
        retry(
            SESSION_RETRY_ATTEMPTS,
            SESSION_RETRY_DELAY,
            ExchangeError::is_not_found,
            || async move {
                let res = self
                    .http_client
                    .get(self.endpoint(path))
                    .header(SESSION_TOKEN_HEADER, token)
                    .query(params)
                    .send()
                    .await
                    .map_err(|err| ExchangeError::bad_gateway(anyerr!(err)))?;
                check_wire_status(res.status())
            },
        )
        .await
    }

    /// Fetches and deciphers response status and headers, defaulting to a
    /// bare 200 when no metadata ever becomes available.
    async fn fetch_meta(
        &self,
        token: &str,
        cipher: &TunnelCipher,
    ) -> (StatusCode, Vec<(HeaderName, HeaderValue)>) {
        let meta = retry(
            SESSION_RETRY_ATTEMPTS,
            SESSION_RETRY_DELAY,
            ExchangeError::is_not_found,
            || async move {
                let res = self
                    .http_client
                    .get(self.endpoint(RESPONSE_META_PATH))
                    .header(SESSION_TOKEN_HEADER, token)
                    .send()
                    .await
                    .map_err(|err| ExchangeError::bad_gateway(anyerr!(err)))?;
                check_wire_status(res.status())?;
                let reply: MetaReply = res
                    .json()
                    .await
                    .map_err(|err| ExchangeError::bad_gateway(anyerr!(err)))?;
                Ok(reply.data)
            },
        )
        .await;

        let payload = match meta {
            Ok(payload) => payload,
            Err(err) => {
                debug!("response metadata unavailable, defaulting to 200: {err:#}");
                return (StatusCode::OK, Vec::new());
            }
        };
        let status = StatusCode::from_u16(payload.i).unwrap_or(StatusCode::OK);
        let mut headers = Vec::new();
        for (enc_name, enc_value) in payload.x {
            let name = cipher.with_fresh_cursor().decrypt_str(&enc_name);
            let value = cipher.with_fresh_cursor().decrypt(&enc_value);
            let (Ok(name), Ok(value)) = (name, value) else {
                warn!("dropping undecipherable response header");
                continue;
            };
            debug!(%name, "response header");
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(&value),
            ) else {
                warn!(%name, "dropping malformed response header");
                continue;
            };
            headers.push((name, value));
        }
        (status, headers)
    }

    /// The URL the egress side will request on the caller's behalf.
    fn target_url(&self, parts: &Parts) -> Result<String, ExchangeError> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        if let Some(base) = &self.target_base {
            let url = base
                .join(path_and_query)
                .map_err(|err| ExchangeError::bad_request(anyerr!(err)))?;
            return Ok(url.to_string());
        }
        // Absolute-form request target (the caller uses us as a forward
        // proxy): take it as-is.
        if parts.uri.scheme().is_some() {
            return Ok(parts.uri.to_string());
        }
        // Origin-form: reconstruct the caller's view of the URL.
        let authority = match parts.uri.authority() {
            Some(authority) => authority.as_str(),
            None => parts
                .headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    ExchangeError::bad_request(anyerr!("request target has no authority"))
                })?,
        };
        Ok(format!("http://{authority}{path_and_query}"))
    }
}

fn check_wire_status(status: StatusCode) -> Result<(), ExchangeError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND {
        Err(ExchangeError::not_found(anyerr!(
            "session not visible at egress"
        )))
    } else {
        Err(ExchangeError::new(
            Some(status),
            anyerr!("tunnel call failed with status {status}"),
        ))
    }
}

/// Deciphers the obfuscated wire stream frame by frame.
///
/// Wire frames are exactly `chunk_size * 4` symbols except the last, so
/// slicing the byte stream at that length re-aligns the per-frame cipher
/// boundaries regardless of how the transport split the bytes.
fn deciphered_body(
    response: reqwest::Response,
    cipher: TunnelCipher,
    chunk_size: usize,
) -> HyperBody {
    let frames = chunk_stream(response.bytes_stream(), chunk_size * 4);
    let frames = frames.map(move |frame| {
        let frame = frame.map_err(io::Error::other)?;
        let text = std::str::from_utf8(&frame).map_err(io::Error::other)?;
        let bytes = cipher
            .with_fresh_cursor()
            .decrypt(text)
            .map_err(io::Error::other)?;
        Ok(Frame::data(Bytes::from(bytes)))
    });
    StreamBody::new(frames).boxed_unsync()
}
