//! Single-node RESP connection
//!
//! The protocol client the coordinator sits on top of: open a TCP session to
//! one sentinel or master, run request/response commands, or turn the session
//! into a pattern subscription.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::protocol::{Parser, RespValue, encode_command};
use crate::sentinel::state::Endpoint;

/// Initial read buffer capacity
const READ_BUFFER_SIZE: usize = 4096;

/// Replies larger than this are treated as a protocol error
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Connect/read deadlines for one session
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            read_timeout: Duration::from_millis(3000),
        }
    }
}

/// One open RESP session
pub struct Connection {
    endpoint: Endpoint,
    stream: TcpStream,
    buffer: BytesMut,
    read_timeout: Duration,
}

impl Connection {
    /// Open a session with a single connection attempt
    pub async fn open(endpoint: &Endpoint, options: &ConnectOptions) -> Result<Self> {
        let addr = endpoint.to_string();

        let stream = match timeout(options.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => return Err(Error::ConnectTimeout(addr)),
        };
        stream.set_nodelay(true)?;

        log::trace!("Connected to {}", addr);

        Ok(Self {
            endpoint: endpoint.clone(),
            stream,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            read_timeout: options.read_timeout,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one command and wait for its reply.
    ///
    /// Error replies are returned as `Error::Reply`.
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        self.stream.write_all(&encode_command(args)).await?;

        match timeout(self.read_timeout, self.read_value()).await {
            Ok(Ok(RespValue::Error(e))) => Err(Error::Reply(String::from_utf8_lossy(&e).into())),
            Ok(result) => result,
            Err(_) => Err(Error::ReadTimeout(self.endpoint.to_string())),
        }
    }

    /// Switch the session to pattern-subscription mode
    pub async fn psubscribe(mut self, pattern: &str) -> Result<Subscription> {
        self.stream
            .write_all(&encode_command(&[b"PSUBSCRIBE", pattern.as_bytes()]))
            .await?;

        let confirmation = match timeout(self.read_timeout, self.read_value()).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ReadTimeout(self.endpoint.to_string())),
        };

        match confirmation {
            RespValue::Array(items)
                if items
                    .first()
                    .and_then(|kind| kind.as_bytes())
                    .is_some_and(|kind| kind.eq_ignore_ascii_case(b"psubscribe")) => {}
            RespValue::Error(e) => return Err(Error::Reply(String::from_utf8_lossy(&e).into())),
            other => {
                return Err(Error::unexpected(
                    "PSUBSCRIBE",
                    format!("expected subscription confirmation, got {:?}", other),
                ));
            }
        }

        Ok(Subscription { conn: self })
    }

    /// Close the session
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn read_value(&mut self) -> Result<RespValue> {
        loop {
            if let Some(value) = Parser::parse(&mut self.buffer)? {
                return Ok(value);
            }

            if self.buffer.len() > MAX_BUFFER_SIZE {
                return Err(Error::Protocol("reply exceeds maximum buffer size".into()));
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed(self.endpoint.to_string()));
            }
        }
    }
}

/// Message published on a subscribed channel
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub channel: Bytes,
    pub payload: Bytes,
}

/// Session in pattern-subscription mode
pub struct Subscription {
    conn: Connection,
}

impl Subscription {
    pub fn endpoint(&self) -> &Endpoint {
        self.conn.endpoint()
    }

    /// Wait for the next published message.
    ///
    /// There is no read deadline here; an idle subscription is normal.
    /// Returns `Ok(None)` when the server closes the session.
    pub async fn next_message(&mut self) -> Result<Option<PublishedMessage>> {
        loop {
            let value = match self.conn.read_value().await {
                Ok(v) => v,
                Err(Error::ConnectionClosed(_)) => return Ok(None),
                Err(e) => return Err(e),
            };

            if let Some(message) = published_message(value) {
                return Ok(Some(message));
            }
        }
    }
}

/// Extract (channel, payload) from a `pmessage` or `message` push
fn published_message(value: RespValue) -> Option<PublishedMessage> {
    let mut items = value.into_array()?;
    let kind = items.first()?.as_bytes()?.clone();

    if kind.eq_ignore_ascii_case(b"pmessage") && items.len() == 4 {
        let payload = items.pop()?.as_bytes()?.clone();
        let channel = items.pop()?.as_bytes()?.clone();
        Some(PublishedMessage { channel, payload })
    } else if kind.eq_ignore_ascii_case(b"message") && items.len() == 3 {
        let payload = items.pop()?.as_bytes()?.clone();
        let channel = items.pop()?.as_bytes()?.clone();
        Some(PublishedMessage { channel, payload })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_published_message_from_pmessage() {
        let value = RespValue::Array(vec![
            RespValue::bulk_string("pmessage"),
            RespValue::bulk_string("*"),
            RespValue::bulk_string("+odown"),
            RespValue::bulk_string("master mymaster 10.0.0.1 6379 #quorum 2"),
        ]);
        let message = published_message(value).unwrap();
        assert_eq!(&message.channel[..], b"+odown");
        assert_eq!(&message.payload[..], b"master mymaster 10.0.0.1 6379 #quorum 2");
    }

    #[test]
    fn test_published_message_ignores_confirmations() {
        let value = RespValue::Array(vec![
            RespValue::bulk_string("psubscribe"),
            RespValue::bulk_string("*"),
            RespValue::Integer(1),
        ]);
        assert!(published_message(value).is_none());
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"+PONG\r\n").await.unwrap();
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"-ERR unknown command\r\n").await.unwrap();
        });

        let endpoint = Endpoint::new("127.0.0.1", port);
        let mut conn = Connection::open(&endpoint, &ConnectOptions::default())
            .await
            .unwrap();

        let reply = conn.command(&[b"PING"]).await.unwrap();
        assert_eq!(reply.to_text().unwrap(), "PONG");

        let err = conn.command(&[b"NOPE"]).await.unwrap_err();
        assert!(matches!(err, Error::Reply(msg) if msg == "ERR unknown command"));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let options = ConnectOptions {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(50),
        };
        let mut conn = Connection::open(&Endpoint::new("127.0.0.1", port), &options)
            .await
            .unwrap();

        let err = conn.command(&[b"INFO"]).await.unwrap_err();
        assert!(matches!(err, Error::ReadTimeout(_)));
    }
}
