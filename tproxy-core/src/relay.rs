use prometheus::IntCounter;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

/// Copy buffer per direction; also the natural back-pressure unit, since a
/// direction reads no further until its previous chunk was written out.
const RELAY_BUFFER_SIZE: usize = 4096;

/// Copies bytes from `src` to `dst` until EOF, an I/O error, the connection
/// deadline, or cancellation.
///
/// The deadline is absolute and never refreshed: a tunnel still alive when
/// it passes is torn down. On any exit the token is cancelled (stopping the
/// paired relay) and `dst` is shut down for writes so the peer observes
/// end-of-stream after the buffered bytes. Returns the byte count relayed
/// in this direction.
pub async fn relay<R, W>(
    src: &mut R,
    dst: &mut W,
    cancel: &CancellationToken,
    deadline: Instant,
    bytes_counter: Option<&IntCounter>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            r = timeout_at(deadline, src.read(&mut buf)) => r,
        };

        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break Err(e),
            Err(_) => {
                break Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "relay deadline exceeded",
                ));
            }
        };

        if n == 0 {
            break Ok(());
        }

        if let Err(e) = dst.write_all(&buf[..n]).await {
            break Err(e);
        }

        total += n as u64;
        if let Some(counter) = bytes_counter {
            counter.inc_by(n as u64);
        }
    };

    cancel.cancel();
    let _ = dst.shutdown().await;

    result.map(|_| total)
}

/// Runs the two relay halves of one connection concurrently under a shared
/// cancellation token and waits for both to finish.
///
/// Returns `(client_to_upstream, upstream_to_client)` byte counts; the first
/// error from either half, if any, is propagated after both halves stopped.
pub async fn bridge<C, U>(
    client: C,
    upstream: U,
    deadline: Instant,
    metrics: Option<(IntCounter, IntCounter)>,
) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let cancel = CancellationToken::new();
    let (tx_counter, rx_counter) = match metrics {
        Some((tx, rx)) => (Some(tx), Some(rx)),
        None => (None, None),
    };

    let (up, down) = tokio::join!(
        relay(
            &mut client_read,
            &mut upstream_write,
            &cancel,
            deadline,
            tx_counter.as_ref(),
        ),
        relay(
            &mut upstream_read,
            &mut client_write,
            &cancel,
            deadline,
            rx_counter.as_ref(),
        ),
    );

    match (up, down) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}
