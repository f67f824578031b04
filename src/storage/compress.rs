//! Gzip body encoding
//!
//! Compresses a body stream on the fly. Compressed bytes are emitted as soon
//! as the encoder produces them; the gzip trailer follows the last chunk.

use crate::upload::ByteStream;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{ready, Stream};
use pin_project_lite::pin_project;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// Gzip-encoding adapter over a [`ByteStream`]
    pub struct GzipStream {
        #[pin]
        inner: ByteStream,
        encoder: Option<GzEncoder<Vec<u8>>>,
    }
}

impl GzipStream {
    pub fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            encoder: Some(GzEncoder::new(Vec::new(), Compression::default())),
        }
    }
}

impl Stream for GzipStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if this.encoder.is_none() {
                return Poll::Ready(None);
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    let Some(encoder) = this.encoder.as_mut() else {
                        return Poll::Ready(None);
                    };
                    if let Err(e) = encoder.write_all(&chunk) {
                        *this.encoder = None;
                        return Poll::Ready(Some(Err(e)));
                    }
                    let buf = encoder.get_mut();
                    if !buf.is_empty() {
                        return Poll::Ready(Some(Ok(Bytes::from(std::mem::take(buf)))));
                    }
                }
                Some(Err(e)) => {
                    *this.encoder = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    return match this.encoder.take().map(|encoder| encoder.finish()) {
                        Some(Ok(tail)) => Poll::Ready(Some(Ok(Bytes::from(tail)))),
                        Some(Err(e)) => Poll::Ready(Some(Err(e))),
                        None => Poll::Ready(None),
                    };
                }
            }
        }
    }
}
