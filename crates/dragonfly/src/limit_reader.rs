use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use tokio::io::{AsyncRead, ReadBuf};

use crate::{error::Error, rate_limiter::RateLimiter};

type Acquire = Pin<Box<dyn Future<Output = i64> + Send>>;

/// Reader that pays the rate limiter for every byte it reads and optionally
/// computes the md5 of everything that went through it.
///
/// The bytes of one read are paid before the next read starts, so the
/// average throughput still converges to the limiter's rate.
pub struct LimitReader<R> {
    inner: R,
    limiter: Option<Arc<RateLimiter>>,
    md5: Option<md5::Context>,
    expected_md5: Option<String>,
    acquire: Option<Acquire>,
    verified: bool,
}

impl<R> LimitReader<R> {
    pub fn new(
        inner: R,
        limiter: Option<Arc<RateLimiter>>,
        calculate_md5: bool,
    ) -> Self {
        Self {
            inner,
            limiter,
            md5: calculate_md5.then(md5::Context::new),
            expected_md5: None,
            acquire: None,
            verified: false,
        }
    }

    /// Fail the read that hits EOF when the md5 of the whole stream does not
    /// match `expected`.
    pub fn expect_md5(mut self, expected: impl Into<String>) -> Self {
        self.md5.get_or_insert_with(md5::Context::new);
        self.expected_md5 = Some(expected.into().to_lowercase());
        self
    }

    /// Lowercase hex md5 of what was read so far.
    pub fn md5(&self) -> Option<String> {
        self.md5.as_ref().map(|ctx| hex::encode(ctx.clone().compute().0))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(acquire) = this.acquire.as_mut() {
            ready!(acquire.as_mut().poll(cx));
            this.acquire = None;
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let read = &buf.filled()[before..];

        if read.is_empty() {
            if !this.verified {
                this.verified = true;
                if let Some(expected) = &this.expected_md5 {
                    let real = this.md5().unwrap_or_default();
                    if &real != expected {
                        let e = Error::Md5NotMatch {
                            real,
                            expected: expected.clone(),
                        };
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            e.to_string(),
                        )));
                    }
                }
            }
            return Poll::Ready(Ok(()));
        }

        if let Some(ctx) = this.md5.as_mut() {
            ctx.consume(read);
        }

        if let Some(limiter) = &this.limiter {
            let limiter = limiter.clone();
            let n = read.len() as i64;
            this.acquire =
                Some(Box::pin(async move { limiter.acquire_blocking(n).await }));
        }

        Poll::Ready(Ok(()))
    }
}
