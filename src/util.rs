use std::{convert::Infallible, io};

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Empty, Full, combinators::UnsyncBoxBody};
use hyper::body::Incoming;
use n0_future::{Stream, StreamExt};
use serde::Serialize;

pub use self::chunker::chunk_stream;
pub(crate) use self::retry::retry;

mod chunker;
mod retry;

/// Body type served by both agents.
pub(crate) type HyperBody = UnsyncBoxBody<Bytes, io::Error>;

/// Converts a hyper request body into a stream of data chunks, dropping
/// non-data frames.
pub(crate) fn body_to_stream(body: Incoming) -> impl Stream<Item = io::Result<Bytes>> {
    http_body_util::BodyStream::new(body).filter_map(|frame| match frame {
        Ok(frame) => frame.into_data().ok().map(Ok),
        Err(err) => Some(Err(io::Error::other(err))),
    })
}

pub(crate) fn empty_body() -> HyperBody {
    Empty::new().map_err(infallible_to_io).boxed_unsync()
}

pub(crate) fn empty_response(status: StatusCode) -> hyper::Response<HyperBody> {
    let mut res = hyper::Response::new(empty_body());
    *res.status_mut() = status;
    res
}

/// Serializes `payload` into a JSON response with the given status.
pub(crate) fn json_response<T: Serialize>(
    status: StatusCode,
    payload: &T,
) -> hyper::Response<HyperBody> {
    let body = serde_json::to_vec(payload).unwrap_or_default();
    let mut res = hyper::Response::new(
        Full::new(Bytes::from(body))
            .map_err(infallible_to_io)
            .boxed_unsync(),
    );
    *res.status_mut() = status;
    res.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    res
}

pub(crate) fn infallible_to_io(err: Infallible) -> io::Error {
    match err {}
}
