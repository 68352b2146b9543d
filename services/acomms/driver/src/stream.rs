//! Nonblocking byte streams and the framed connection built on them.
//!
//! A [`ByteStream`] is either a TCP socket or one end of an in-memory pipe.
//! [`FramedConnection`] adds outbound buffering and the byte-stuffed message
//! decoder, so drivers only deal in whole payloads.

use crate::error::DriverError;
use acomms_wire::framing::MIN_MESSAGE_SIZE;
use acomms_wire::{encode_message, StreamDecoder, WireError};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;

/// One end of an in-memory byte pipe
#[derive(Debug)]
pub struct PipeEnd {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Create two connected in-memory streams
pub fn pipe() -> (ByteStream, ByteStream) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ByteStream::Pipe(PipeEnd { tx: a_tx, rx: b_rx }),
        ByteStream::Pipe(PipeEnd { tx: b_tx, rx: a_rx }),
    )
}

/// A nonblocking byte stream
#[derive(Debug)]
pub enum ByteStream {
    /// TCP socket
    Tcp(TcpStream),
    /// In-memory pipe
    Pipe(PipeEnd),
}

impl ByteStream {
    /// Wrap a connected TCP socket, switching it to nonblocking mode
    pub fn tcp(stream: TcpStream) -> Result<Self, DriverError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(ByteStream::Tcp(stream))
    }

    /// Describe the remote end for logs
    pub fn peer(&self) -> String {
        match self {
            ByteStream::Tcp(stream) => stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            ByteStream::Pipe(_) => "pipe".to_string(),
        }
    }

    /// Append everything currently readable to `buf`.
    ///
    /// Returns `true` once the remote end has closed.
    pub fn read_available(&mut self, buf: &mut BytesMut) -> io::Result<bool> {
        match self {
            ByteStream::Tcp(stream) => {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => return Ok(true),
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            ByteStream::Pipe(end) => loop {
                match end.rx.try_recv() {
                    Ok(bytes) => buf.extend_from_slice(&bytes),
                    Err(TryRecvError::Empty) => return Ok(false),
                    Err(TryRecvError::Disconnected) => return Ok(true),
                }
            },
        }
    }

    /// Write as much of `out` as the stream accepts without blocking
    pub fn write_available(&mut self, out: &mut BytesMut) -> io::Result<()> {
        match self {
            ByteStream::Tcp(stream) => {
                while !out.is_empty() {
                    match stream.write(out) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => out.advance(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            ByteStream::Pipe(end) => {
                if out.is_empty() {
                    return Ok(());
                }
                end.tx
                    .send(out.split().freeze())
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }
    }

    /// Close the stream
    pub fn close(&mut self) {
        match self {
            ByteStream::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            ByteStream::Pipe(end) => end.rx.close(),
        }
    }
}

/// A byte stream carrying byte-stuffed, CRC-checked messages
#[derive(Debug)]
pub struct FramedConnection {
    stream: ByteStream,
    decoder: StreamDecoder,
    max_message_size: usize,
    inbound: BytesMut,
    outbound: BytesMut,
    closed: bool,
}

impl FramedConnection {
    /// Wrap a stream, accepting messages up to `max_message_size`
    pub fn new(stream: ByteStream, max_message_size: usize) -> Self {
        Self {
            stream,
            decoder: StreamDecoder::with_max_message_size(max_message_size),
            max_message_size: max_message_size.clamp(MIN_MESSAGE_SIZE, u16::MAX as usize),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            closed: false,
        }
    }

    /// Describe the remote end for logs
    pub fn peer(&self) -> String {
        self.stream.peer()
    }

    /// Frame `payload` and start writing it. Returns the framed bytes.
    ///
    /// Payloads the peer's decoder would reject as oversize are refused.
    pub fn send(&mut self, payload: &[u8]) -> Result<Bytes, DriverError> {
        let size = MIN_MESSAGE_SIZE + payload.len();
        if size > self.max_message_size {
            return Err(WireError::Size(size).into());
        }
        let framed = encode_message(payload)?;
        self.outbound.extend_from_slice(&framed);
        self.flush()?;
        Ok(framed)
    }

    /// Continue writing buffered output
    pub fn flush(&mut self) -> Result<(), DriverError> {
        self.stream
            .write_available(&mut self.outbound)
            .map_err(|e| DriverError::Connection(format!("write to {} failed: {}", self.peer(), e)))
    }

    /// Bytes still waiting to be written
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Read whatever the stream has. Returns the raw bytes read, if any.
    pub fn fill(&mut self) -> Result<Option<Bytes>, DriverError> {
        if self.closed {
            return Err(DriverError::Connection(format!("{} closed the stream", self.peer())));
        }

        let start = self.inbound.len();
        let eof = self
            .stream
            .read_available(&mut self.inbound)
            .map_err(|e| DriverError::Connection(format!("read from {} failed: {}", self.peer(), e)))?;

        if eof {
            debug!("Stream closed by peer: {}", self.peer());
            self.closed = true;
        }
        if self.inbound.len() == start {
            if eof {
                return Err(DriverError::Connection(format!("{} closed the stream", self.peer())));
            }
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.inbound[start..])))
    }

    /// Next complete payload from the bytes read so far.
    ///
    /// Messages failing the size, escape or CRC checks are logged and skipped.
    pub fn next_message(&mut self) -> Option<Bytes> {
        loop {
            match self.decoder.decode(&mut self.inbound) {
                Ok(message) => return message,
                Err(e) => warn!("Discarding framed message from {}: {}", self.peer(), e),
            }
        }
    }

    /// Close the underlying stream
    pub fn close(&mut self) {
        self.stream.close();
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acomms_wire::{DEFAULT_MAX_MESSAGE_SIZE, ESCAPE, MAGIC};
    use std::net::TcpListener;

    #[test]
    fn test_pipe_round_trip() {
        let (a, b) = pipe();
        let mut left = FramedConnection::new(a, DEFAULT_MAX_MESSAGE_SIZE);
        let mut right = FramedConnection::new(b, DEFAULT_MAX_MESSAGE_SIZE);

        left.send(&[1, MAGIC, 2]).unwrap();
        left.send(&[ESCAPE, ESCAPE]).unwrap();

        let raw = right.fill().unwrap().unwrap();
        assert_eq!(raw[0], MAGIC);
        assert_eq!(right.next_message().unwrap().as_ref(), &[1, MAGIC, 2]);
        assert_eq!(right.next_message().unwrap().as_ref(), &[ESCAPE, ESCAPE]);
        assert!(right.next_message().is_none());
        assert!(right.fill().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_message_skipped() {
        let (a, b) = pipe();
        let mut right = FramedConnection::new(b, DEFAULT_MAX_MESSAGE_SIZE);
        let ByteStream::Pipe(end) = a else { unreachable!() };

        let mut corrupt = BytesMut::from(encode_message(b"bad").unwrap().as_ref());
        // magic, size, version, reserved, then the first payload byte
        corrupt[5] ^= 0x01;
        end.tx.send(corrupt.freeze()).unwrap();
        end.tx.send(encode_message(b"good").unwrap()).unwrap();

        right.fill().unwrap();
        assert_eq!(right.next_message().unwrap().as_ref(), b"good");
        assert!(right.next_message().is_none());
    }

    #[test]
    fn test_oversize_payload_refused() {
        let (a, b) = pipe();
        let mut left = FramedConnection::new(a, 64);
        let mut right = FramedConnection::new(b, 64);

        let err = left.send(&[0x11; 64]).unwrap_err();
        assert!(matches!(err, DriverError::Wire(WireError::Size(70))));
        assert!(!err.is_fatal());
        assert_eq!(left.pending_output(), 0);

        left.send(&[0x11; 58]).unwrap();
        right.fill().unwrap();
        assert_eq!(right.next_message().unwrap().len(), 58);
    }

    #[test]
    fn test_pipe_close_reported() {
        let (a, b) = pipe();
        let mut right = FramedConnection::new(b, DEFAULT_MAX_MESSAGE_SIZE);
        let mut left = FramedConnection::new(a, DEFAULT_MAX_MESSAGE_SIZE);
        left.send(b"last").unwrap();
        drop(left);

        assert!(right.fill().unwrap().is_some());
        assert_eq!(right.next_message().unwrap().as_ref(), b"last");
        assert!(matches!(right.fill(), Err(DriverError::Connection(_))));
    }

    #[test]
    fn test_tcp_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut left = FramedConnection::new(ByteStream::tcp(client).unwrap(), DEFAULT_MAX_MESSAGE_SIZE);
        let mut right = FramedConnection::new(ByteStream::tcp(server).unwrap(), DEFAULT_MAX_MESSAGE_SIZE);
        left.send(b"over tcp").unwrap();
        assert_eq!(left.pending_output(), 0);

        let mut message = None;
        for _ in 0..200 {
            right.fill().unwrap();
            message = right.next_message();
            if message.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(message.unwrap().as_ref(), b"over tcp");
    }
}
