//! The host-side TCP socket of a relayed connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Connects to `remote`, giving up after `limit` if one is set.
pub(crate) async fn connect_upstream(
    remote: SocketAddr,
    limit: Option<Duration>,
) -> io::Result<TcpStream> {
    let connect = TcpStream::connect(remote);
    let stream = match limit {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))??,
        None => connect.await?,
    };
    // Segments from the device are already sized by its stack; don't add Nagle delay on top.
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Closes the connection with an RST instead of a FIN, so the remote sees the abort.
///
/// The halves are reunited first: dropping a lone write half would half-close gracefully.
#[allow(deprecated)]
pub(crate) fn abort_upstream(reader: OwnedReadHalf, writer: OwnedWriteHalf) -> io::Result<()> {
    let stream = reader
        .reunite(writer)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "halves of different sockets"))?;
    // Zero linger makes close() discard unsent data and reset the connection.
    stream.set_linger(Some(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_sets_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, accepted) = tokio::join!(
            connect_upstream(addr, Some(Duration::from_secs(5))),
            listener.accept()
        );
        assert!(stream.unwrap().nodelay().unwrap());
        accepted.unwrap();
    }

    #[tokio::test]
    async fn connect_without_limit_reports_refusal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_upstream(addr, None).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abort_resets_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, accepted) = tokio::join!(connect_upstream(addr, None), listener.accept());
        let (mut peer, _) = accepted.unwrap();

        let (reader, writer) = stream.unwrap().into_split();
        abort_upstream(reader, writer).unwrap();

        let mut buf = [0u8; 16];
        let err = peer.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
