//! Byte-stream transport and message framing.
//!
//! Two framings are supported:
//!
//! - **Header-delimited**: `Content-Length: N\r\n\r\n` followed by exactly
//!   `N` bytes of payload (other headers such as `Content-Type` are ignored)
//! - **Length-prefixed**: a 4-byte big-endian length followed by the payload
//!
//! Either framing runs over any duplex byte channel: stdin/stdout, or a TCP
//! socket that is either accepted on a listening address or connected out.
//! Malformed framing is fatal; the caller closes the connection.

use std::net::SocketAddr;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};

use crate::error::TransportError;

/// Maximum frame size (64 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Boxed read half of a channel.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Boxed write half of a channel.
pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// How message boundaries are encoded on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// `Content-Length` header block, blank line, payload.
    #[default]
    Header,
    /// 4-byte big-endian length, payload.
    LengthPrefixed,
}

/// The duplex channel the session runs over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// stdin for reading, stdout for writing.
    Stdio,
    /// Listen on an address and serve the first accepted connection.
    TcpListen(SocketAddr),
    /// Connect out to a client that is listening.
    TcpConnect(SocketAddr),
}

impl Channel {
    /// Opens the channel and returns its read and write halves.
    ///
    /// # Errors
    ///
    /// Returns an error if binding, accepting or connecting fails.
    pub async fn open(&self) -> std::io::Result<(BoxReader, BoxWriter)> {
        match self {
            Self::Stdio => Ok((Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))),
            Self::TcpListen(addr) => {
                let listener = TcpListener::bind(addr).await?;
                tracing::info!(addr = %listener.local_addr()?, "Waiting for client connection");
                let (stream, peer) = listener.accept().await?;
                tracing::info!(peer = %peer, "Client connected");
                Ok(split_tcp(stream))
            }
            Self::TcpConnect(addr) => {
                let stream = TcpStream::connect(addr).await?;
                tracing::info!(peer = %addr, "Connected to client");
                Ok(split_tcp(stream))
            }
        }
    }
}

fn split_tcp(stream: TcpStream) -> (BoxReader, BoxWriter) {
    // Frames are small and latency-sensitive.
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let (read, write) = stream.into_split();
    (Box::new(read), Box::new(write))
}

/// Reads whole frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    framing: Framing,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a reader using the given framing.
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader: BufReader::new(reader),
            framing,
        }
    }

    /// Reads the next frame payload.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed headers, oversized frames, or EOF in
    /// the middle of a frame.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let len = match self.framing {
            Framing::Header => self.read_headers().await?,
            Framing::LengthPrefixed => self.read_length_prefix().await?,
        };
        let Some(len) = len else {
            return Ok(None);
        };

        if len > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge {
                len,
                max: MAX_FRAME_BYTES,
            });
        }

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| eof_as(e, "frame body"))?;
        Ok(Some(body))
    }

    /// Parses headers until the empty separator line.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF before any
    /// header byte.
    async fn read_headers(&mut self) -> Result<Option<usize>, TransportError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(TransportError::UnexpectedEof { context: "headers" });
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':') {
                if key.trim().eq_ignore_ascii_case("Content-Length") {
                    let value = value.trim();
                    let len = value
                        .parse()
                        .map_err(|_| TransportError::InvalidContentLength {
                            value: value.to_string(),
                        })?;
                    content_length = Some(len);
                }
            }
        }

        content_length
            .map(Some)
            .ok_or(TransportError::MissingContentLength)
    }

    async fn read_length_prefix(&mut self) -> Result<Option<usize>, TransportError> {
        let mut prefix = [0u8; 4];
        let first = self.reader.read(&mut prefix[..1]).await?;
        if first == 0 {
            return Ok(None);
        }
        self.reader
            .read_exact(&mut prefix[1..])
            .await
            .map_err(|e| eof_as(e, "length prefix"))?;
        Ok(Some(u32::from_be_bytes(prefix) as usize))
    }
}

fn eof_as(err: std::io::Error, context: &'static str) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::UnexpectedEof { context }
    } else {
        TransportError::Io(err)
    }
}

/// Writes whole frames to an async writer.
///
/// A single `FrameWriter` must own the output; concurrent producers go
/// through the server's outgoing queue so frames never interleave.
pub struct FrameWriter<W> {
    writer: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a writer using the given framing.
    pub const fn new(writer: W, framing: Framing) -> Self {
        Self { writer, framing }
    }

    /// Writes one frame and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails or the payload does not fit the
    /// length prefix.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        match self.framing {
            Framing::Header => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                self.writer.write_all(header.as_bytes()).await?;
            }
            Framing::LengthPrefixed => {
                let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge {
                    len: body.len(),
                    max: u32::MAX as usize,
                })?;
                self.writer.write_all(&len.to_be_bytes()).await?;
            }
        }
        self.writer.write_all(body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shuts down the write half.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying shutdown fails.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
