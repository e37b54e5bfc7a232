//! In-process communication channels.
//!
//! A channel connects two endpoints living in the same process (the
//! scheduler loop, its tasks, the listener handlers). Messages are encoded
//! exactly as on a socket, so both sides can also exchange raw payloads.
//! Every write is delivered as one unit: several writers sharing a
//! [`ChannelKind::Multiplexing`] channel never interleave partial messages.

use tokio::sync::mpsc::{
    self, UnboundedReceiver, UnboundedSender,
    error::TryRecvError,
};

use crate::{
    Message, TransportError,
    transport::{extract_line, has_line},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// The first endpoint writes, the second one reads.
    Simplex,
    /// Both endpoints read and write independently.
    FullDuplex,
    /// Like `Simplex`, but the writing endpoint can be shared by many writers.
    Multiplexing,
}

/// Create a channel and return its two endpoints.
pub fn create(kind: ChannelKind) -> (Endpoint, Endpoint) {
    match kind {
        ChannelKind::Simplex | ChannelKind::Multiplexing => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Endpoint::new(kind, None, Some(tx)),
                Endpoint::new(kind, Some(rx), None),
            )
        }
        ChannelKind::FullDuplex => {
            let (tx_ab, rx_ab) = mpsc::unbounded_channel();
            let (tx_ba, rx_ba) = mpsc::unbounded_channel();
            (
                Endpoint::new(kind, Some(rx_ba), Some(tx_ab)),
                Endpoint::new(kind, Some(rx_ab), Some(tx_ba)),
            )
        }
    }
}

#[derive(Debug)]
pub struct Endpoint {
    kind: ChannelKind,
    reader: Option<UnboundedReceiver<Vec<u8>>>,
    writer: Option<UnboundedSender<Vec<u8>>>,
    buffer: Vec<u8>,
}

impl Endpoint {
    fn new(
        kind: ChannelKind,
        reader: Option<UnboundedReceiver<Vec<u8>>>,
        writer: Option<UnboundedSender<Vec<u8>>>,
    ) -> Self {
        Self {
            kind,
            reader,
            writer,
            buffer: Vec::new(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// A new write-only endpoint on the same channel.
    ///
    /// Only the writing side of a multiplexing channel can be shared.
    pub fn share_writer(&self) -> Option<Endpoint> {
        if self.kind != ChannelKind::Multiplexing {
            return None;
        }
        let writer = self.writer.clone()?;
        Some(Endpoint::new(self.kind, None, Some(writer)))
    }

    pub fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        let mut line = message.encode().into_bytes();
        line.push(b'\n');
        self.send_data(line)
    }

    pub fn send_data(&self, data: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        let writer = self.writer.as_ref().ok_or(TransportError::NotConnected)?;
        writer.send(data.into()).map_err(|_| TransportError::Closed)
    }

    /// Next message.
    ///
    /// Without `block`, returns `None` when nothing is available yet. With
    /// it, waits and returns `None` only once every writer is gone.
    pub async fn wait_message(&mut self, block: bool) -> Option<Message> {
        loop {
            if let Some(line) = extract_line(&mut self.buffer) {
                return Some(Message::decode(&String::from_utf8_lossy(&line)));
            }
            if !self.pull(block).await {
                return None;
            }
        }
    }

    /// Exactly `size` raw bytes, under the same rules as [`wait_message`](Self::wait_message).
    pub async fn wait_data(&mut self, size: usize, block: bool) -> Option<Vec<u8>> {
        while self.buffer.len() < size {
            if !self.pull(block).await {
                return None;
            }
        }
        Some(self.buffer.drain(..size).collect())
    }

    /// Whether a message can be read without waiting.
    pub fn has_pending(&self) -> bool {
        has_line(&self.buffer) || self.reader.as_ref().is_some_and(|r| !r.is_empty())
    }

    /// Release both directions. Pending readers on the other side see the end
    /// of the channel once every writer is closed.
    pub fn close(&mut self) {
        self.writer.take();
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        self.buffer.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    async fn pull(&mut self, block: bool) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let chunk = if block {
            reader.recv().await
        } else {
            match reader.try_recv() {
                Ok(chunk) => Some(chunk),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            }
        };
        match chunk {
            Some(chunk) => {
                self.buffer.extend_from_slice(&chunk);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLICATED: &str = "This\nis a \"complicated\"\n'parameter'";

    #[tokio::test]
    async fn full_duplex_delivers_both_ways() {
        let (mut a, mut b) = create(ChannelKind::FullDuplex);

        let to_b = Message::new("SOME_NAME").arg(1).arg(2.0).arg(COMPLICATED);
        a.send_message(&to_b).unwrap();
        assert_eq!(b.wait_message(true).await, Some(to_b));

        let to_a = Message::new("ANSWER").arg("hello world");
        b.send_message(&to_a).unwrap();
        assert_eq!(a.wait_message(true).await, Some(to_a));

        assert!(a.wait_message(false).await.is_none());
        assert!(b.wait_message(false).await.is_none());
    }

    #[tokio::test]
    async fn simplex_is_one_way() {
        let (writer, mut reader) = create(ChannelKind::Simplex);
        assert!(reader.send_message(&Message::new("NOPE")).is_err());
        assert!(writer.share_writer().is_none());

        writer.send_message(&Message::new("OK")).unwrap();
        assert!(reader.has_pending());
        assert_eq!(reader.wait_message(false).await, Some(Message::new("OK")));
        assert!(!reader.has_pending());
    }

    #[tokio::test]
    async fn multiplexing_writers_share_one_reader() {
        let (writer, mut reader) = create(ChannelKind::Multiplexing);
        let mut handles = Vec::new();
        for id in 0..8 {
            let w = writer.share_writer().unwrap();
            handles.push(tokio::spawn(async move {
                w.send_message(&Message::new("DONE").arg(id)).unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(writer);

        let mut ids = Vec::new();
        while let Some(msg) = reader.wait_message(true).await {
            assert_eq!(msg.name, "DONE");
            ids.push(msg.int(0).unwrap());
        }
        ids.sort();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn raw_data_after_a_header() {
        let (a, mut b) = create(ChannelKind::Simplex);
        a.send_message(&Message::new("DATA").arg(3)).unwrap();
        a.send_data(b"xyzREST\n".to_vec()).unwrap();

        let header = b.wait_message(true).await.unwrap();
        let data = b.wait_data(header.int(0).unwrap() as usize, true).await;
        assert_eq!(data.as_deref(), Some(&b"xyz"[..]));
        assert_eq!(b.wait_message(true).await, Some(Message::new("REST")));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_the_peer() {
        let (mut a, mut b) = create(ChannelKind::FullDuplex);
        a.close();
        a.close();
        assert!(a.is_closed());
        assert!(b.wait_message(true).await.is_none());
        assert!(b.send_message(&Message::new("LATE")).is_err());
    }
}
