//! Stream fan-out
//!
//! Forks one source stream into independent readers. The source is read
//! exactly once; every chunk is handed to every live subscriber as a shared
//! [`Bytes`] handle, so copies cost a refcount rather than a memcpy.
//!
//! Subscriber queues are unbounded: a subscriber that is slow, or that stops
//! reading because its transform failed, never holds back the others. A
//! subscriber that drops its reader is simply skipped from then on.
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_fanout::upload::StreamFanout;
//! # use mizuchi_fanout::upload::ByteStream;
//! # async fn example(source: ByteStream) {
//! let mut fanout = StreamFanout::new(source);
//! let small = fanout.subscribe();
//! let large = fanout.subscribe();
//! let pump = fanout.spawn();
//! // hand `small` and `large` to their pipelines...
//! # drop((small, large));
//! let stats = pump.await.unwrap();
//! println!("read {} bytes", stats.bytes);
//! # }
//! ```

use super::ByteStream;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use std::io;
use tokio::task::JoinHandle;

type Subscriber = mpsc::UnboundedSender<io::Result<Bytes>>;

/// What the pump did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    /// Bytes read from the source
    pub bytes: u64,
    /// Chunks read from the source
    pub chunks: u64,
    /// Subscribers when pumping started
    pub subscribers: usize,
    /// Subscribers that went away before the source ended
    pub detached: usize,
    /// Whether the source ended with an error
    pub source_failed: bool,
}

/// Tee of one byte stream into many
pub struct StreamFanout {
    source: ByteStream,
    subscribers: Vec<Subscriber>,
}

impl StreamFanout {
    pub fn new(source: ByteStream) -> Self {
        Self {
            source,
            subscribers: Vec::new(),
        }
    }

    /// Register a new independent reader
    ///
    /// Must be called before the pump starts; readers see the stream from
    /// its first chunk.
    pub fn subscribe(&mut self) -> ByteStream {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.push(tx);
        rx.boxed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Run the pump on its own task
    pub fn spawn(self) -> JoinHandle<FanoutStats> {
        tokio::spawn(self.run())
    }

    /// Read the source to the end, feeding every subscriber
    ///
    /// Stops early once every subscriber has gone. A source error is passed
    /// on to every live subscriber and ends the stream.
    pub async fn run(mut self) -> FanoutStats {
        let mut stats = FanoutStats {
            subscribers: self.subscribers.len(),
            ..FanoutStats::default()
        };

        while !self.subscribers.is_empty() {
            match self.source.next().await {
                Some(Ok(chunk)) => {
                    stats.bytes += chunk.len() as u64;
                    stats.chunks += 1;
                    self.subscribers
                        .retain(|tx| tx.unbounded_send(Ok(chunk.clone())).is_ok());
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Upload source failed");
                    stats.source_failed = true;
                    for tx in &self.subscribers {
                        let _ = tx.unbounded_send(Err(io::Error::new(e.kind(), e.to_string())));
                    }
                    break;
                }
                None => break,
            }
        }

        stats.detached = stats.subscribers - self.subscribers.len();
        tracing::debug!(
            bytes = stats.bytes,
            chunks = stats.chunks,
            subscribers = stats.subscribers,
            detached = stats.detached,
            "Fan-out finished"
        );
        stats
    }
}
