use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use super::TransferProgress;

/// Counts every byte read through it into the shared transfer counters.
/// End of data or a read error latches the completion flag.
#[derive(Debug)]
pub struct ProgressReader<R> {
    inner: R,
    progress: Arc<TransferProgress>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, progress: Arc<TransferProgress>) -> Self {
        Self { inner, progress }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n == 0 && buf.remaining() > 0 {
                    this.progress.finish();
                } else {
                    this.progress.record(n as u64);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                this.progress.fail(&err);
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
