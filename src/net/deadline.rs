//! Absolute read/write deadlines over any async stream.
//!
//! A deadline applies to every I/O call until it is moved or cleared. Once it
//! passes, pending and future operations in that direction fail with
//! `ErrorKind::TimedOut`.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

#[derive(Debug, Default)]
struct Timer {
    sleep: Option<Pin<Box<Sleep>>>,
    armed_at: Option<Instant>,
}

impl Timer {
    fn set(&mut self, deadline: Option<Instant>) {
        match (deadline, self.sleep.as_mut()) {
            (Some(at), Some(sleep)) => sleep.as_mut().reset(at),
            (Some(at), None) => self.sleep = Some(Box::pin(sleep_until(at))),
            (None, _) => {
                self.sleep = None;
                self.armed_at = None;
            }
        }
    }

    fn rearm(&mut self, now: Instant, window: Duration) -> bool {
        let stale = match self.armed_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) > window / 4,
        };
        if stale {
            self.set(Some(now + window));
            self.armed_at = Some(now);
        }
        stale
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

fn timed_out(direction: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{direction} deadline exceeded"))
}

/// A stream with independent read and write deadlines.
#[derive(Debug)]
pub struct Deadlined<T> {
    inner: T,
    read: Timer,
    write: Timer,
}

impl<T> Deadlined<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            read: Timer::default(),
            write: Timer::default(),
        }
    }

    /// Sets or clears the absolute read deadline.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read.set(deadline);
    }

    /// Sets or clears the absolute write deadline.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write.set(deadline);
    }

    /// Moves the read deadline to `now + window` unless it was armed less
    /// than a quarter of `window` ago. Returns whether it moved.
    pub fn refresh_read_deadline(&mut self, now: Instant, window: Duration) -> bool {
        self.read.rearm(now, window)
    }

    /// Write-side counterpart of [`Deadlined::refresh_read_deadline`].
    pub fn refresh_write_deadline(&mut self, now: Instant, window: Duration) -> bool {
        self.write.rearm(now, window)
    }

    pub fn clear_deadlines(&mut self) {
        self.read.set(None);
        self.write.set(None);
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Deadlined<T> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_read(cx, buf) {
            return Poll::Ready(res);
        }
        if this.read.poll_expired(cx) {
            return Poll::Ready(Err(timed_out("read")));
        }
        Poll::Pending
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Deadlined<T> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_write(cx, buf) {
            return Poll::Ready(res);
        }
        if this.write.poll_expired(cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Poll::Pending
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_flush(cx) {
            return Poll::Ready(res);
        }
        if this.write.poll_expired(cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Poll::Pending
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn read_deadline_fires() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = Deadlined::new(client);
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut byte = [0u8; 1];
        let err = conn.read(&mut byte).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_deadline_allows_reads() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = Deadlined::new(client);
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(10)));
        conn.set_read_deadline(None);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            server.write_all(b"x").await.unwrap();
        });
        let mut byte = [0u8; 1];
        conn.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"x");
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_skips_recent_arm() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = Deadlined::new(client);
        let window = Duration::from_secs(4);
        let start = Instant::now();
        assert!(conn.refresh_write_deadline(start, window));
        assert!(!conn.refresh_write_deadline(start + Duration::from_millis(500), window));
        assert!(conn.refresh_write_deadline(start + Duration::from_millis(1500), window));
    }
}
