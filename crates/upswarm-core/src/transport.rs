// ABOUTME: TCP connection plumbing for the supervisor: one reader and one writer task per peer.
// ABOUTME: Decoded messages and close notifications flow to the event loop over a channel.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::message::Message;
use crate::registry::{ConnectionHandle, ConnectionId};

/// What a connection reports to the event loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A complete message arrived, in the order the peer wrote it.
    Received { conn: ConnectionId, message: Message },
    /// The peer closed or the socket failed.
    Closed { conn: ConnectionId },
}

/// Start the reader and writer tasks for an accepted stream.
///
/// Lines that do not decode into a [`Message`] are dropped. The returned
/// handle enqueues outbound lines; the writer stops once every handle is
/// dropped or the socket fails.
pub fn start_connection(
    conn: ConnectionId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> ConnectionHandle {
    let (reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                tracing::debug!(conn = %conn, error = %e, "Write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if line.trim_ascii().is_empty() {
                        continue;
                    }
                    match Message::decode_bytes(&line) {
                        Ok(message) => {
                            if events
                                .send(ConnectionEvent::Received { conn, message })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(conn = %conn, error = %e, "Dropping undecodable message");
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(conn = %conn, error = %e, "Read failed");
                    break;
                }
            }
        }
        let _ = events.send(ConnectionEvent::Closed { conn });
    });

    ConnectionHandle::new(conn, outbound_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order_and_garbage_is_skipped() {
        let (server, mut client) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = start_connection(ConnectionId(7), server, tx);

        let mut payload = Message::text("one").encode_line().unwrap();
        payload.push_str("this is not json\n\n");
        payload.push_str(&Message::text("two").encode_line().unwrap());
        client.write_all(payload.as_bytes()).await.unwrap();

        for expected in ["one", "two"] {
            match next(&mut rx).await {
                ConnectionEvent::Received { conn, message } => {
                    assert_eq!(conn, ConnectionId(7));
                    assert_eq!(message, Message::text(expected));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_connection_open() {
        let (server, mut client) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = start_connection(ConnectionId(1), server, tx);

        client.write_all(b"\xff\xfe garbage\n").await.unwrap();
        client
            .write_all(Message::text("after").encode_line().unwrap().as_bytes())
            .await
            .unwrap();

        match next(&mut rx).await {
            ConnectionEvent::Received { conn, message } => {
                assert_eq!(conn, ConnectionId(1));
                assert_eq!(message, Message::text("after"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_split_across_writes_is_reassembled() {
        let (server, mut client) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = start_connection(ConnectionId(1), server, tx);

        let line = Message::spawn_service("worker").encode_line().unwrap();
        let (head, tail) = line.split_at(line.len() / 2);
        client.write_all(head.as_bytes()).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(tail.as_bytes()).await.unwrap();

        match next(&mut rx).await {
            ConnectionEvent::Received { message, .. } => {
                assert_eq!(message, Message::spawn_service("worker"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_is_reported() {
        let (server, client) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = start_connection(ConnectionId(3), server, tx);

        drop(client);
        assert!(matches!(
            next(&mut rx).await,
            ConnectionEvent::Closed { conn } if conn == ConnectionId(3)
        ));
    }

    #[tokio::test]
    async fn test_handle_writes_lines_to_peer() {
        let (server, client) = pair().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = start_connection(ConnectionId(3), server, tx);

        handle.write(&Message::text("hello").with_receipt("abc")).unwrap();

        let mut lines = BufReader::new(client).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            Message::decode_line(&line).unwrap(),
            Message::text("hello").with_receipt("abc")
        );
    }
}
