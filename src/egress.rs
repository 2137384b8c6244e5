//! Egress agent ("Castor"): the tunnel's server side.
//!
//! Owns session creation, accumulates enciphered request fragments, performs
//! the one real outbound HTTP call, and streams the response back through the
//! tunnel as obfuscated text. Never contacted by end clients directly; its
//! only peer is the ingress agent.

use std::{collections::HashMap, io, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::{Request, Response, body::Frame, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use n0_error::{Result, StdResultExt, e, stack_error};
use n0_future::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    cipher::TunnelCipher,
    codec::CodecError,
    store::{DynSessionStore, HeaderKind, SessionRecord, SessionStore, StoreError, random_token},
    util::{HyperBody, chunk_stream, json_response},
    wire::{
        ADD_BODY_PATH, ADD_HEADER_PATH, AckReply, CREATE_SESSION_PATH, EXECUTE_PATH, MetaPayload,
        MetaReply, RESPONSE_META_PATH, SESSION_TOKEN_HEADER, STATUS_PSEUDO_HEADER, SessionReply,
    },
};

/// Session lifetime from creation.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default size in bytes of one plaintext tunnel frame.
///
/// The egress side enciphers the upstream body in slices of three times this
/// value, so each full wire frame is exactly four times this value in symbols
/// and the peer can re-align frame boundaries by length alone.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// How long a completed session lingers before deletion.
///
/// The ingress agent may still be fetching response metadata when the body
/// finishes streaming; deletion waits out its retry window.
const CLEANUP_GRACE: Duration = Duration::from_secs(5);

/// Failure of a single tunnel operation.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum EgressError {
    /// No matching, non-expired session for the presented token.
    #[error("session not found")]
    SessionNotFound,
    /// The store itself failed; fatal to this call, never retried here.
    #[error("session store failed")]
    Store {
        #[error(source)]
        source: StoreError,
    },
    /// A tunnel field could not be deciphered back to well-formed plaintext.
    #[error("malformed tunnel field")]
    Codec {
        #[error(source)]
        source: CodecError,
    },
    /// The real upstream target was unreachable or the transfer failed.
    #[error("upstream request failed")]
    Upstream {
        #[error(source, std_err)]
        source: reqwest::Error,
    },
    #[error("bad request: {reason}")]
    BadRequest { reason: String },
}

impl EgressError {
    /// Status surfaced on the tunnel wire for this failure.
    pub fn response_status(&self) -> StatusCode {
        match self {
            EgressError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            EgressError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            EgressError::Codec { .. } | EgressError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            EgressError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

fn store_err(source: StoreError) -> EgressError {
    e!(EgressError::Store { source })
}

fn codec_err(source: CodecError) -> EgressError {
    e!(EgressError::Codec { source })
}

/// Result of [`EgressProxy::create_session`].
#[derive(Debug)]
pub struct SessionHandshake {
    /// Capability token for every subsequent call.
    pub token: String,
    /// Session secret, enciphered under the shared master key.
    pub wrapped_secret: String,
}

/// Status code plus enciphered response header pairs, ready for the wire.
#[derive(Debug)]
pub struct ResponseMeta {
    pub status: u16,
    /// Enciphered `(name, value)` pairs.
    pub headers: Vec<(String, String)>,
}

/// The egress proxy agent.
///
/// All collaborators are injected at construction: the session store, the
/// outbound HTTP client, and the master key. One instance serves any number
/// of concurrent sessions.
#[derive(derive_more::Debug, Clone)]
pub struct EgressProxy {
    #[debug("Arc<DynSessionStore>")]
    store: Arc<DynSessionStore<'static>>,
    #[debug(skip)]
    master: TunnelCipher,
    http_client: reqwest::Client,
    chunk_size: usize,
    session_ttl: Duration,
}

impl EgressProxy {
    /// Creates an egress proxy over the given store, keyed by the shared
    /// master key.
    pub fn new(store: impl SessionStore + 'static, master_key: &str) -> Self {
        Self {
            store: DynSessionStore::new_arc(store),
            master: TunnelCipher::new(master_key),
            http_client: reqwest::Client::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            session_ttl: SESSION_TTL,
        }
    }

    /// Overrides the plaintext frame size (default [`DEFAULT_CHUNK_SIZE`]).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Overrides the session lifetime (default [`SESSION_TTL`]).
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Allocates a new session: fresh random secret, store-minted id, expiry
    /// one TTL from now. The secret leaves this agent exactly once, wrapped
    /// under the master key.
    pub async fn create_session(&self) -> Result<SessionHandshake, EgressError> {
        let secret = random_token(32);
        let token = self
            .store
            .create_session(secret.clone(), self.session_ttl)
            .await
            .map_err(store_err)?;
        let wrapped_secret = self.master.with_fresh_cursor().encrypt_str(&secret);
        debug!(%token, "created session");
        Ok(SessionHandshake {
            token,
            wrapped_secret,
        })
    }

    /// Single lookup; visibility retries are the caller's concern.
    async fn resolve_session(&self, token: &str) -> Result<SessionRecord, EgressError> {
        match self.store.get_session(token).await.map_err(store_err)? {
            Some(session) => Ok(session),
            None => {
                warn!(%token, "no matching session");
                Err(e!(EgressError::SessionNotFound))
            }
        }
    }

    /// Deciphers one request header and stores it as a fragment. No upstream
    /// call happens yet.
    ///
    /// The name must decipher to UTF-8 (header names are tokens); the value
    /// is kept as raw bytes, obs-text included.
    pub async fn add_header(
        &self,
        token: &str,
        enc_name: &str,
        enc_value: &str,
    ) -> Result<(), EgressError> {
        let session = self.resolve_session(token).await?;
        let cipher = TunnelCipher::new(&session.secret);
        let name = cipher
            .with_fresh_cursor()
            .decrypt_str(enc_name)
            .map_err(codec_err)?;
        let value = cipher
            .with_fresh_cursor()
            .decrypt(enc_value)
            .map_err(codec_err)?;
        debug!(session = %session.id, %name, "add header");
        self.store
            .upsert_header(&session.id, HeaderKind::Request, &name, &value)
            .await
            .map_err(store_err)
    }

    /// Deciphers one body chunk and stores it at `index`. Chunks may arrive
    /// in any order; a re-sent index replaces the previous value.
    pub async fn add_body_chunk(
        &self,
        token: &str,
        index: u64,
        enc_chunk: &str,
    ) -> Result<(), EgressError> {
        let session = self.resolve_session(token).await?;
        let chunk = TunnelCipher::new(&session.secret)
            .with_fresh_cursor()
            .decrypt(enc_chunk)
            .map_err(codec_err)?;
        debug!(session = %session.id, index, len = chunk.len(), "add body chunk");
        self.store
            .upsert_body_chunk(&session.id, index, chunk.into())
            .await
            .map_err(store_err)
    }

    /// Reconstructs the original request from the stored fragments, performs
    /// it against the real upstream, stores the response status and headers,
    /// and returns the response body as a lazy stream of obfuscated frames.
    ///
    /// The returned stream owns a guard that deletes the session once the
    /// stream completes, errors, or is dropped mid-flight.
    pub async fn execute(
        &self,
        token: &str,
        enc_method: &str,
        enc_url: &str,
    ) -> Result<impl Stream<Item = io::Result<Bytes>> + Send + use<>, EgressError> {
        let session = self.resolve_session(token).await?;
        let cipher = TunnelCipher::new(&session.secret);
        let method = cipher
            .with_fresh_cursor()
            .decrypt_str(enc_method)
            .map_err(codec_err)?;
        let url = cipher
            .with_fresh_cursor()
            .decrypt_str(enc_url)
            .map_err(codec_err)?;
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| {
            e!(EgressError::BadRequest {
                reason: "invalid method".to_string(),
            })
        })?;
        let url = reqwest::Url::parse(&url).map_err(|_| {
            e!(EgressError::BadRequest {
                reason: "invalid url".to_string(),
            })
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in self
            .store
            .list_headers(&session.id, HeaderKind::Request)
            .await
            .map_err(store_err)?
        {
            // Zeroed so the upstream replies uncompressed and the body can be
            // re-enciphered transparently.
            let value: &[u8] = if name.eq_ignore_ascii_case("accept-encoding") {
                b""
            } else {
                &value
            };
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) else {
                warn!(session = %session.id, %name, "dropping malformed header");
                continue;
            };
            headers.append(name, value);
        }

        let chunks = self
            .store
            .list_body_chunks(&session.id)
            .await
            .map_err(store_err)?;
        let body: Vec<u8> = chunks.concat();

        debug!(
            session = %session.id, %method, %url, body_len = body.len(),
            "execute upstream request"
        );
        let response = self
            .http_client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|source| e!(EgressError::Upstream { source }))?;

        self.store
            .upsert_header(
                &session.id,
                HeaderKind::Response,
                STATUS_PSEUDO_HEADER,
                response.status().as_u16().to_string().as_bytes(),
            )
            .await
            .map_err(store_err)?;
        for (name, value) in response.headers() {
            // Re-encoding changes the body length on the wire.
            if name == http::header::CONTENT_LENGTH {
                continue;
            }
            debug!(session = %session.id, name = %name, "store response header");
            self.store
                .upsert_header(
                    &session.id,
                    HeaderKind::Response,
                    name.as_str(),
                    value.as_bytes(),
                )
                .await
                .map_err(store_err)?;
        }

        Ok(self.obfuscated_body(session, response))
    }

    /// Returns the stored response status (default 200 when absent or
    /// unparsable) and the remaining response headers, enciphered for the
    /// wire one field at a time.
    pub async fn response_meta(&self, token: &str) -> Result<ResponseMeta, EgressError> {
        let session = self.resolve_session(token).await?;
        let cipher = TunnelCipher::new(&session.secret);
        let mut status = 200u16;
        let mut headers = Vec::new();
        for (name, value) in self
            .store
            .list_headers(&session.id, HeaderKind::Response)
            .await
            .map_err(store_err)?
        {
            if name == STATUS_PSEUDO_HEADER {
                if let Some(parsed) = std::str::from_utf8(&value)
                    .ok()
                    .and_then(|v| v.parse().ok())
                {
                    status = parsed;
                }
            } else {
                headers.push((
                    cipher.with_fresh_cursor().encrypt_str(&name),
                    cipher.with_fresh_cursor().encrypt(&value),
                ));
            }
        }
        debug!(session = %session.id, status, header_count = headers.len(), "response meta");
        Ok(ResponseMeta { status, headers })
    }

    /// Lazily enciphers the live upstream body, one fixed-size slice at a
    /// time, each frame from a fresh cursor. Dropping the returned stream
    /// drops the upstream response (closing its connection) and schedules
    /// session deletion.
    fn obfuscated_body(
        &self,
        session: SessionRecord,
        response: reqwest::Response,
    ) -> impl Stream<Item = io::Result<Bytes>> + Send + use<> {
        let cipher = TunnelCipher::new(&session.secret);
        let cleanup = CleanupGuard {
            store: self.store.clone(),
            session_id: session.id,
        };
        chunk_stream(response.bytes_stream(), self.chunk_size * 3).map(move |frame| {
            let _tied_to_stream = &cleanup;
            match frame {
                Ok(bytes) => Ok(Bytes::from(
                    cipher.with_fresh_cursor().encrypt(&bytes).into_bytes(),
                )),
                Err(err) => Err(io::Error::other(err)),
            }
        })
    }

    /// Serves the five tunnel endpoints on `listener` until cancelled.
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
                        debug!(%peer_addr, "accepted tunnel connection");
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let this = this.clone();
                            async move {
                                Ok::<_, std::convert::Infallible>(this.handle(req).await)
                            }
                        });
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            warn!("failed to serve tunnel connection: {err:#}");
                        }
                    })
                    .instrument(error_span!("egress-conn", id)),
            );
            id += 1;
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<HyperBody> {
        let path = req.uri().path().to_string();
        match self.route(req).await {
            Ok(res) => res,
            Err(err) => {
                let status = err.response_status();
                warn!(%path, %status, "tunnel call failed: {err:#}");
                json_response(
                    status,
                    &serde_json::json!({"result": 0, "detail": err.to_string()}),
                )
            }
        }
    }

    async fn route(&self, req: Request<Incoming>) -> Result<Response<HyperBody>, EgressError> {
        let query = parse_query(req.uri().query().unwrap_or(""));
        let token = req
            .headers()
            .get(SESSION_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        match req.uri().path() {
            CREATE_SESSION_PATH => {
                let handshake = self.create_session().await?;
                Ok(json_response(
                    StatusCode::OK,
                    &SessionReply {
                        result: 1,
                        token: handshake.token,
                        data: handshake.wrapped_secret,
                    },
                ))
            }
            ADD_HEADER_PATH => {
                let x = required_param(&query, "x")?;
                let y = required_param(&query, "y")?;
                self.add_header(&token, x, y).await?;
                Ok(json_response(StatusCode::OK, &AckReply::ok()))
            }
            ADD_BODY_PATH => {
                let index: u64 = required_param(&query, "i")?.parse().map_err(|_| {
                    e!(EgressError::BadRequest {
                        reason: "invalid chunk index".to_string(),
                    })
                })?;
                let chunk = required_param(&query, "j")?;
                self.add_body_chunk(&token, index, chunk).await?;
                Ok(json_response(StatusCode::OK, &AckReply::ok()))
            }
            EXECUTE_PATH => {
                let method = required_param(&query, "m")?;
                let url = required_param(&query, "n")?;
                let frames = self.execute(&token, method, url).await?;
                let body =
                    StreamBody::new(frames.map(|frame| frame.map(Frame::data))).boxed_unsync();
                let mut res = Response::new(body);
                res.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                );
                Ok(res)
            }
            RESPONSE_META_PATH => {
                let meta = self.response_meta(&token).await?;
                Ok(json_response(
                    StatusCode::OK,
                    &MetaReply {
                        result: 1,
                        data: MetaPayload {
                            x: meta.headers,
                            i: meta.status,
                        },
                    },
                ))
            }
            _ => Err(e!(EgressError::BadRequest {
                reason: "unknown tunnel endpoint".to_string(),
            })),
        }
    }
}

/// Deletes its session when dropped, after a grace delay; see
/// [`CLEANUP_GRACE`]. Held by the obfuscated body stream so cleanup runs
/// exactly once whether the stream completes, errors, or is aborted.
struct CleanupGuard {
    store: Arc<DynSessionStore<'static>>,
    session_id: String,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let store = self.store.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%session_id, "no runtime at stream drop; session will expire instead");
            return;
        };
        handle.spawn(async move {
            tokio::time::sleep(CLEANUP_GRACE).await;
            debug!(%session_id, "deleting completed session");
            if let Err(err) = store.delete_session(&session_id).await {
                warn!(%session_id, "failed to delete session: {err:#}");
            }
        });
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn required_param<'a>(
    query: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a str, EgressError> {
    query.get(name).map(String::as_str).ok_or_else(|| {
        e!(EgressError::BadRequest {
            reason: format!("missing query parameter {name}"),
        })
    })
}
