//! Response body types handed to the HTTP server

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ProxyError;

pub type ProxyBody = BoxBody<Bytes, ProxyError>;

/// Sending half of a streamed response body
pub type BodySender = mpsc::Sender<Result<Frame<Bytes>, ProxyError>>;

/// Frames buffered between the upstream reader and the client writer
const STREAM_BUFFER_FRAMES: usize = 16;

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// A body fed frame by frame from another task.
///
/// Dropping the sender ends the body; sending an `Err` aborts it.
pub fn channel() -> (BodySender, ProxyBody) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER_FRAMES);
    let body = StreamBody::new(ReceiverStream::new(rx)).boxed();
    (tx, body)
}
