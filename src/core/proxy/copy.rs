//! Size-bounded streaming copy from the upstream body to the client.
//!
//! Chunks are staged into a buffer borrowed from a process-wide pool
//! and written downstream when the buffer fills. With a flush interval
//! configured, a periodic tick pushes out whatever is staged so slow
//! upstreams still render progressively; without one, every chunk is
//! written through as it arrives. The timer and the stream share the
//! session writer inside a single `select!` owner, so no lock is
//! needed to keep writes from interleaving.

use bytes::Bytes;
use deadpool::managed::{Manager, Metrics, RecycleResult};
use futures_util::StreamExt;
use pingora::proxy::Session;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Copy buffer size. Large enough to amortize write syscalls, small
/// enough that concurrent streams do not dominate allocator pressure.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on concurrently borrowed copy buffers; getting a
/// buffer past this waits, which backpressures accepts.
const POOL_MAX: usize = 256;

pub struct BufferManager {
    capacity: usize,
}

impl Manager for BufferManager {
    type Type = Vec<u8>;
    type Error = std::convert::Infallible;

    async fn create(&self) -> Result<Vec<u8>, Self::Error> {
        Ok(Vec::with_capacity(self.capacity))
    }

    async fn recycle(&self, buf: &mut Vec<u8>, _: &Metrics) -> RecycleResult<Self::Error> {
        buf.clear();
        Ok(())
    }
}

pub type BufferPool = deadpool::managed::Pool<BufferManager>;

/// Creates the process-wide copy buffer pool.
///
/// # Panics
///
/// Panics if the pool builder rejects the configuration (startup
/// error).
#[must_use]
pub fn create_buffer_pool() -> BufferPool {
    BufferPool::builder(BufferManager {
        capacity: BUFFER_SIZE,
    })
    .max_size(POOL_MAX)
    .build()
    .expect("Failed to create copy buffer pool")
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("upstream read error: {0}")]
    Read(reqwest::Error),

    #[error("client write error: {0}")]
    Write(Box<pingora::Error>),

    #[error("response exceeded {max_size} bytes")]
    TooLarge { max_size: u64 },

    #[error("copy buffer pool unavailable")]
    Pool,
}

/// Copies the upstream body to the session, returning the bytes
/// written. Enforces `max_size` on the bytes actually streamed and
/// terminates early when it is exceeded. `on_exit_flush_loop` fires as
/// the flush loop exits (only when a flush interval is active); it
/// exists for deterministic test coordination.
pub async fn copy_body<S>(
    session: &mut Session,
    mut body: S,
    pool: &BufferPool,
    max_size: u64,
    flush_interval: Duration,
    on_exit_flush_loop: Option<&(dyn Fn() + Send + Sync)>,
) -> Result<u64, CopyError>
where
    S: futures_util::Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let mut staged = pool.get().await.map_err(|_| CopyError::Pool)?;
    let flush_enabled = !flush_interval.is_zero();
    let mut ticker = flush_enabled.then(|| tokio::time::interval(flush_interval));

    let result = async {
        let mut written: u64 = 0;
        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(data)) => {
                        if written + staged.len() as u64 + data.len() as u64 > max_size {
                            return Err(CopyError::TooLarge { max_size });
                        }
                        let mut rest: &[u8] = &data;
                        while !rest.is_empty() {
                            let room = BUFFER_SIZE - staged.len();
                            let take = room.min(rest.len());
                            staged.extend_from_slice(&rest[..take]);
                            rest = &rest[take..];
                            if staged.len() == BUFFER_SIZE || !flush_enabled {
                                written += flush_staged(session, &mut staged).await?;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "upstream read error during body copy");
                        return Err(CopyError::Read(e));
                    }
                    None => break,
                },
                _ = tick(&mut ticker) => {
                    if !staged.is_empty() {
                        written += flush_staged(session, &mut staged).await?;
                    }
                }
            }
        }

        if !staged.is_empty() {
            written += flush_staged(session, &mut staged).await?;
        }
        Ok(written)
    }
    .await;

    if flush_enabled {
        if let Some(hook) = on_exit_flush_loop {
            hook();
        }
    }

    result
}

async fn flush_staged(session: &mut Session, staged: &mut Vec<u8>) -> Result<u64, CopyError> {
    let len = staged.len() as u64;
    session
        .write_response_body(Some(Bytes::copy_from_slice(staged)), false)
        .await
        .map_err(CopyError::Write)?;
    staged.clear();
    Ok(len)
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
