use bytes::{Bytes, BytesMut};
use futures::stream;
use http::{Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// Body type shared by every response this proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, BodyError>;

const FILE_CHUNK_SIZE: usize = 64 * 1024;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn incoming(body: Incoming) -> ProxyBody {
    body.map_err(BodyError::from).boxed_unsync()
}

/// Body fed by a channel. A closed channel ends the body; an `Err` item aborts it.
pub fn channel(rx: mpsc::Receiver<Result<Bytes, BodyError>>) -> ProxyBody {
    let frames = stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item.map(Frame::data), rx))
    });
    StreamBody::new(frames).boxed_unsync()
}

/// Streams a file in fixed-size chunks. Dropping the body closes the file.
pub fn file(file: File) -> ProxyBody {
    let frames = stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = BytesMut::with_capacity(FILE_CHUNK_SIZE);
        match file.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(Frame::data(buf.freeze())), Some(file))),
            Err(err) => Some((Err(BodyError::from(err)), None)),
        }
    });
    StreamBody::new(frames).boxed_unsync()
}

pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

pub fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = status;
    resp
}
