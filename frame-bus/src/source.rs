use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::TransportError;

/// Result of a single read from a [`ByteSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Zero or more bytes. Empty means the read timed out with nothing to show.
    Data(Bytes),
    EndOfStream,
}

/// The transport as seen by the pipeline: an ordered sequence of byte chunks.
pub trait ByteSource: Send {
    /// Returns at most `max_len` bytes and never blocks past the source's read timeout.
    fn read(&mut self, max_len: usize) -> Result<ReadOutcome, TransportError>;

    fn close(&mut self) {}

    fn description(&self) -> String;
}

/// Raw H.264 over a plain TCP connection.
pub struct TcpSource {
    addr: String,
    stream: Option<TcpStream>,
    buf: BytesMut,
}

impl TcpSource {
    pub fn connect(
        addr: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                source: e,
            })?
            .next()
            .ok_or_else(|| TransportError::Resolve(addr.to_string()))?;

        log::info!("connecting to {} ({})", addr, resolved);
        let connect_err = |e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        };
        let stream = TcpStream::connect_timeout(&resolved, connect_timeout).map_err(connect_err)?;
        stream.set_read_timeout(Some(read_timeout)).map_err(connect_err)?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay on {} failed: {}", addr, e);
        }
        log::debug!("socket to {} ready", addr);

        Ok(Self {
            addr: addr.to_string(),
            stream: Some(stream),
            buf: BytesMut::new(),
        })
    }
}

impl ByteSource for TcpSource {
    fn read(&mut self, max_len: usize) -> Result<ReadOutcome, TransportError> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(ReadOutcome::EndOfStream),
        };
        read_chunk(stream, &mut self.buf, max_len)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            log::info!("closed connection to {}", self.addr);
        }
    }

    fn description(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Adapts any blocking reader (a file holding a raw `.h264` dump, stdin, a pipe).
pub struct ReaderSource<R> {
    name: String,
    reader: Option<R>,
    buf: BytesMut,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(name: &str, reader: R) -> Self {
        Self {
            name: name.to_string(),
            reader: Some(reader),
            buf: BytesMut::new(),
        }
    }
}

impl<R: Read + Send> ByteSource for ReaderSource<R> {
    fn read(&mut self, max_len: usize) -> Result<ReadOutcome, TransportError> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(ReadOutcome::EndOfStream),
        };
        read_chunk(reader, &mut self.buf, max_len)
    }

    fn close(&mut self) {
        self.reader.take();
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}

fn read_chunk<R: Read>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_len: usize,
) -> Result<ReadOutcome, TransportError> {
    buf.clear();
    buf.resize(max_len, 0);
    loop {
        match reader.read(&mut buf[..]) {
            Ok(0) => return Ok(ReadOutcome::EndOfStream),
            Ok(n) => {
                buf.truncate(n);
                return Ok(ReadOutcome::Data(buf.split().freeze()));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(ReadOutcome::Data(Bytes::new()));
            }
            Err(e) => return Err(TransportError::Read(e)),
        }
    }
}
