//! Length-prefixed piece framing over raw byte streams.
//!
//! Every physical frame is a 4-byte big-endian length followed by one CBOR
//! piece: `{queue_id, this_piece, total_pieces, digest, data}`. A message
//! whose encoded body fits under [`limits::SPLIT_THRESHOLD`] travels as a
//! single piece; larger bodies are fragmented and reassembled in exact
//! order, keyed by queue id. The digest in every piece covers the whole
//! message body, so a reassembled message is verified before it is decoded.
//!
//! Framing failures are fatal to the connection that produced them. A body
//! that reassembles fine but does not decode to a known [`Message`] is
//! not: the session skips it and keeps reading.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tether_core::Digest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FramingError, Result, SyncError};
use crate::messages::{limits, Message};

/// One physical frame: a fragment of an encoded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Piece {
    queue_id: u32,
    this_piece: u32,
    total_pieces: u32,
    digest: Digest,
    data: Vec<u8>,
}

/// Writes messages as framed pieces.
pub struct FrameWriter<W> {
    writer: W,
    next_queue_id: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_queue_id: rand::random(),
        }
    }

    /// Encode, fragment if needed, and write one message.
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        if let Err(reason) = message.validate_limits() {
            return Err(SyncError::ProtocolViolation(reason.to_string()));
        }
        let body = message.encode()?;
        let digest = Digest::of(&body);
        let total = body.len().div_ceil(limits::SPLIT_THRESHOLD).max(1) as u32;
        let queue_id = self.next_queue_id;
        self.next_queue_id = self.next_queue_id.wrapping_add(1);

        let mut chunks = body.chunks(limits::SPLIT_THRESHOLD);
        for this_piece in 1..=total {
            let piece = Piece {
                queue_id,
                this_piece,
                total_pieces: total,
                digest,
                data: chunks.next().unwrap_or(&[]).to_vec(),
            };
            self.write_piece(&piece).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_piece(&mut self, piece: &Piece) -> Result<()> {
        let mut frame = Vec::with_capacity(piece.data.len() + 64);
        ciborium::into_writer(piece, &mut frame)
            .map_err(|e| FramingError::Malformed(e.to_string()))?;
        if frame.len() > limits::MAX_PIECE_SIZE {
            return Err(FramingError::Oversize {
                size: frame.len(),
                cap: limits::MAX_PIECE_SIZE,
            }
            .into());
        }
        self.writer
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    /// Shut down the underlying stream, flushing buffered data.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Reads framed pieces and reassembles whole messages.
pub struct FrameReader<R> {
    reader: R,
    buffers: HashMap<u32, Reassembly>,
    read_timeout: Option<Duration>,
}

struct Reassembly {
    digest: Digest,
    total_pieces: u32,
    received: u32,
    data: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffers: HashMap::new(),
            read_timeout: None,
        }
    }

    /// Bound every piece read. A peer silent past the limit is dead.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Read pieces until one whole message reassembles and decodes.
    pub async fn read_message(&mut self) -> Result<Message> {
        loop {
            let piece = self.read_piece().await?;
            if let Some(body) = self.accept(piece)? {
                return Message::decode(&body);
            }
        }
    }

    async fn read_piece(&mut self) -> Result<Piece> {
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read_piece_from(&mut self.reader))
                .await
                .map_err(|_| SyncError::Timeout("waiting for next frame".into()))?,
            None => read_piece_from(&mut self.reader).await,
        }
    }

    /// Feed one piece into reassembly. Returns a complete, digest-verified
    /// message body.
    fn accept(&mut self, piece: Piece) -> Result<Option<BytesMut>> {
        if piece.total_pieces <= 1 {
            let computed = Digest::of(&piece.data);
            if computed != piece.digest {
                return Err(FramingError::DigestMismatch {
                    expected: piece.digest.to_hex(),
                    computed: computed.to_hex(),
                }
                .into());
            }
            return Ok(Some(BytesMut::from(piece.data.as_slice())));
        }

        if piece.this_piece == 1 {
            // A first piece replaces any stale buffer under the same id.
            self.buffers.insert(
                piece.queue_id,
                Reassembly {
                    digest: piece.digest,
                    total_pieces: piece.total_pieces,
                    received: 1,
                    data: BytesMut::from(piece.data.as_slice()),
                },
            );
            return Ok(None);
        }

        let Some(buffer) = self.buffers.get_mut(&piece.queue_id) else {
            return Err(FramingError::OutOfOrder {
                queue_id: piece.queue_id,
                expected: 1,
                got: piece.this_piece,
            }
            .into());
        };
        if piece.this_piece != buffer.received + 1 {
            let expected = buffer.received + 1;
            self.buffers.remove(&piece.queue_id);
            return Err(FramingError::OutOfOrder {
                queue_id: piece.queue_id,
                expected,
                got: piece.this_piece,
            }
            .into());
        }
        if piece.digest != buffer.digest {
            let expected = buffer.digest.to_hex();
            self.buffers.remove(&piece.queue_id);
            return Err(FramingError::DigestMismatch {
                expected,
                computed: piece.digest.to_hex(),
            }
            .into());
        }
        if piece.total_pieces != buffer.total_pieces {
            self.buffers.remove(&piece.queue_id);
            return Err(FramingError::Malformed("piece count changed mid-queue".into()).into());
        }
        if buffer.data.len() + piece.data.len() > limits::MAX_PIECE_SIZE {
            let size = buffer.data.len() + piece.data.len();
            self.buffers.remove(&piece.queue_id);
            return Err(FramingError::Oversize {
                size,
                cap: limits::MAX_PIECE_SIZE,
            }
            .into());
        }

        buffer.data.extend_from_slice(&piece.data);
        buffer.received += 1;
        if piece.this_piece < piece.total_pieces {
            return Ok(None);
        }

        let Some(done) = self.buffers.remove(&piece.queue_id) else {
            return Ok(None);
        };
        let computed = Digest::of(&done.data);
        if computed != done.digest {
            return Err(FramingError::DigestMismatch {
                expected: done.digest.to_hex(),
                computed: computed.to_hex(),
            }
            .into());
        }
        Ok(Some(done.data))
    }
}

async fn read_piece_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Piece> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > limits::MAX_PIECE_SIZE {
        return Err(FramingError::Oversize {
            size: len,
            cap: limits::MAX_PIECE_SIZE,
        }
        .into());
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    ciborium::from_reader(frame.as_slice())
        .map_err(|e| FramingError::Malformed(e.to_string()).into())
}
