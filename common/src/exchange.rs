//! HTTP-aware byte forwarding between two sockets.
//!
//! One exchange is one full request/response cycle: `forward` the request
//! from the user side to the tunnel side, then `forward` the response back.
//! Each direction stops at the end of one logical HTTP message (or at EOF),
//! which is what lets the data connection go back into the idle pool
//! instead of being torn down.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::detector::HttpDetector;

/// Per-read buffer size.
pub const READ_BUF_LEN: usize = 2 * 1024 * 1024;

/// Bridge one request/response cycle: `forward(a -> b)` then `forward(b -> a)`.
pub async fn exchange<A, B>(a: &mut A, b: &mut B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    forward(a, b).await?;
    forward(b, a).await
}

/// Copy one logical HTTP message from `src` to `dst`.
///
/// Bytes are written to `dst` before the detector sees them, so a slow scan
/// never delays data. Stops when a fresh [`HttpDetector`] reports the
/// message complete or `src` reaches end-of-stream; EOF is a graceful stop,
/// any other read or write error is returned.
pub async fn forward<S, D>(src: &mut S, dst: &mut D) -> io::Result<()>
where
    S: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
{
    let mut detector = HttpDetector::new();
    let mut buf = vec![0u8; READ_BUF_LEN];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        detector.observe(&buf[..n]);
        if detector.is_complete() {
            break;
        }
    }
    Ok(())
}
