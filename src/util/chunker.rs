//! Exact-size re-chunking for byte streams.
//!
//! Both agents depend on frame boundaries re-aligning deterministically: the
//! egress side enciphers the upstream body in fixed-size slices, and the
//! ingress side must slice the wire stream at exactly the enciphered frame
//! size to decipher each frame from a fresh cursor. This adapter is the only
//! buffering primitive in the tunnel core.

use bytes::{Bytes, BytesMut};
use n0_future::{Stream, StreamExt, stream};

/// Re-buffers `input` into frames of exactly `chunk_size` bytes.
///
/// The final frame holds the remainder and may be shorter; empty input yields
/// an empty stream. Emitted bytes are not retained. An error item from the
/// input is forwarded once and terminates the output, dropping any bytes
/// buffered before it.
pub fn chunk_stream<S, E>(input: S, chunk_size: usize) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Send,
{
    debug_assert!(chunk_size > 0);
    let input = Box::pin(input);
    stream::unfold(
        (input, BytesMut::new(), false),
        move |(mut input, mut buf, mut done)| async move {
            loop {
                if buf.len() >= chunk_size {
                    let frame = buf.split_to(chunk_size).freeze();
                    return Some((Ok(frame), (input, buf, done)));
                }
                if done {
                    if buf.is_empty() {
                        return None;
                    }
                    let frame = buf.split().freeze();
                    return Some((Ok(frame), (input, buf, done)));
                }
                match input.next().await {
                    Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                    Some(Err(err)) => {
                        buf.clear();
                        done = true;
                        return Some((Err(err), (input, buf, done)));
                    }
                    None => done = true,
                }
            }
        },
    )
}
