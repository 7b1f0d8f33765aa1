//! # Physical Connection
//!
//! Purpose: One authenticated TCP session to the store, driven on the I/O
//! runtime, with buffers reused across commands.
//!
//! ## Design Principles
//! 1. **Encode on the Caller, Transfer on I/O**: Commands are framed into the
//!    write buffer before the connection moves to an I/O worker.
//! 2. **Pipeline Ordering**: One stream per connection; replies are read in
//!    the order commands were written.
//! 3. **Poison on Failure**: Any transport or framing error marks the
//!    connection broken so it never re-enters the pool.

use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::endpoint::EndpointConfig;
use crate::error::{ClientError, ClientResult};
use crate::resp::{encode_command, parse_response, RespValue};

pub(crate) struct Connection {
    id: u64,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    pending: usize,
    broken: bool,
}

impl Connection {
    /// Opens, authenticates and selects the database for a new session.
    ///
    /// `connect_timeout` bounds the whole setup, handshake included, so a
    /// server that accepts but never answers AUTH fails the same way as an
    /// unreachable one.
    pub(crate) async fn connect(id: u64, endpoint: &EndpointConfig) -> ClientResult<Self> {
        match timeout(endpoint.connect_timeout, Self::establish(id, endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectTimeout {
                address: endpoint.address(),
                timeout: endpoint.connect_timeout,
            }),
        }
    }

    async fn establish(id: u64, endpoint: &EndpointConfig) -> ClientResult<Self> {
        let address = endpoint.address();
        let connected = TcpStream::connect(address.as_str()).await;
        let stream = match connected {
            Ok(stream) => stream,
            Err(source) => return Err(ClientError::Connect { address, source }),
        };
        // Small request/response frames; Nagle only adds latency.
        stream.set_nodelay(true)?;

        let mut conn = Connection {
            id,
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: Vec::with_capacity(256),
            pending: 0,
            broken: false,
        };
        conn.handshake(endpoint).await?;
        Ok(conn)
    }

    async fn handshake(&mut self, endpoint: &EndpointConfig) -> ClientResult<()> {
        if let Some(credential) = &endpoint.credential {
            match credential.username() {
                Some(user) => self.queue(&[b"AUTH", user.as_bytes(), credential.secret()]),
                None => self.queue(&[b"AUTH", credential.secret()]),
            }
            match self.flush_one().await? {
                RespValue::Simple(_) => {}
                RespValue::Error(message) => {
                    return Err(ClientError::Auth {
                        message: String::from_utf8_lossy(&message).into_owned(),
                    })
                }
                _ => return Err(ClientError::UnexpectedResponse),
            }
        }

        if endpoint.database != 0 {
            let db = endpoint.database.to_string();
            self.queue(&[b"SELECT", db.as_bytes()]);
            match self.flush_one().await? {
                RespValue::Simple(_) => {}
                RespValue::Error(message) => return Err(ClientError::server(&message)),
                _ => return Err(ClientError::UnexpectedResponse),
            }
        }
        Ok(())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    /// Appends one command to the outgoing pipeline.
    pub(crate) fn queue(&mut self, args: &[&[u8]]) {
        encode_command(args, &mut self.write_buf);
        self.pending += 1;
    }

    /// Writes every queued command and reads one reply per command.
    ///
    /// If this future is dropped mid-flight the connection stays marked
    /// broken, since replies may still be in transit.
    pub(crate) async fn flush(&mut self) -> ClientResult<Vec<RespValue>> {
        self.broken = true;
        let expected = std::mem::take(&mut self.pending);
        let result = self.transfer(expected).await;
        self.write_buf.clear();
        if result.is_ok() {
            self.broken = false;
        }
        result
    }

    async fn flush_one(&mut self) -> ClientResult<RespValue> {
        let mut replies = self.flush().await?;
        replies.pop().ok_or(ClientError::Protocol)
    }

    async fn transfer(&mut self, expected: usize) -> ClientResult<Vec<RespValue>> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        let mut replies = Vec::with_capacity(expected);
        while replies.len() < expected {
            if let Some((value, used)) = parse_response(&self.read_buf)? {
                self.read_buf.advance(used);
                replies.push(value);
                continue;
            }
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
        Ok(replies)
    }
}
