use std::{io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use super::{TransportError, extract_line, has_line};
use crate::Message;

const READ_CHUNK: usize = 4096;

/// Newline framed messages and raw payloads over one byte stream.
///
/// Bytes read ahead of the current message stay buffered, so a raw payload
/// announced by a message can already be partially in memory.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    buffer: Vec<u8>,
    eof: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            eof: false,
        }
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let mut line = message.encode().into_bytes();
        line.push(b'\n');
        self.send_data(&line).await
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next message, or `None` once the peer closed the stream.
    pub async fn wait_message(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            if let Some(line) = extract_line(&mut self.buffer) {
                let line = String::from_utf8(line).map_err(|_| TransportError::InvalidUtf8)?;
                return Ok(Some(Message::decode(&line)));
            }
            if self.eof {
                return Ok(None);
            }
            self.read_more().await?;
        }
    }

    /// Like [`wait_message`](Self::wait_message), giving up after `limit`.
    pub async fn wait_message_for(
        &mut self,
        limit: Option<Duration>,
    ) -> Result<Option<Message>, TransportError> {
        match limit {
            None => self.wait_message().await,
            Some(limit) => tokio::time::timeout(limit, self.wait_message())
                .await
                .map_err(|_| TransportError::Timeout(limit.as_secs()))?,
        }
    }

    /// Like [`wait_message`](Self::wait_message) but returns `None` as soon as
    /// `interrupt` is cancelled. Nothing buffered is lost.
    pub async fn wait_message_or_cancel(
        &mut self,
        interrupt: &CancellationToken,
    ) -> Result<Option<Message>, TransportError> {
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => Ok(None),
            res = self.wait_message() => res,
        }
    }

    /// Exactly `size` raw bytes, or `None` if the peer closed the stream first.
    pub async fn wait_data(&mut self, size: usize) -> Result<Option<Vec<u8>>, TransportError> {
        while self.buffer.len() < size {
            if self.eof {
                return Ok(None);
            }
            self.read_more().await?;
        }
        Ok(Some(self.buffer.drain(..size).collect()))
    }

    pub async fn wait_data_for(
        &mut self,
        size: usize,
        limit: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        match limit {
            None => self.wait_data(size).await,
            Some(limit) => tokio::time::timeout(limit, self.wait_data(size))
                .await
                .map_err(|_| TransportError::Timeout(limit.as_secs()))?,
        }
    }

    /// Whether a complete message is already buffered.
    pub fn has_message(&self) -> bool {
        has_line(&self.buffer)
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn read_more(&mut self) -> Result<(), TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }
}

impl Connection<TcpStream> {
    /// Move whatever the socket already holds into the buffer, without waiting.
    ///
    /// Returns the number of bytes read; reaching the end of the stream is
    /// reported by [`at_eof`](Self::at_eof).
    pub fn fill_nonblocking(&mut self) -> Result<usize, TransportError> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        while !self.eof {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    total += n;
                    self.buffer.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}
