use crate::error::Result;

use async_trait::async_trait;
use bytes::BytesMut;
use log::{info, warn};
use net2::TcpStreamExt;
use std::io::{Error as IoError, ErrorKind};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const TCP_KEEPALIVE_SECS: u64 = 60;

/// Byte stream to the plant. Reads block until the buffer is full; a short
/// read is an error. Bytes received before a read timed out are kept for the
/// next read.
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self);
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
}

fn not_open() -> IoError {
    IoError::new(ErrorKind::NotConnected, "transport is not open")
}

/// Fills `buf` from `pending`, topping it up from `stream` as needed.
///
/// Bytes that arrived before a timeout stay in `pending` for the next call,
/// so a read cut short never drops part of a frame.
async fn read_with_timeout<S>(
    stream: &mut S,
    pending: &mut BytesMut,
    buf: &mut [u8],
    read_timeout: Option<Duration>,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    while pending.len() < buf.len() {
        let read = match read_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.read_buf(pending)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(IoError::new(
                        ErrorKind::TimedOut,
                        format!("no data received for {} seconds", limit.as_secs()),
                    )
                    .into())
                }
            },
            None => stream.read_buf(pending).await?,
        };
        if read == 0 {
            return Err(IoError::new(ErrorKind::UnexpectedEof, "stream closed by peer").into());
        }
    }

    buf.copy_from_slice(&pending.split_to(buf.len()));
    Ok(())
}

async fn write_and_flush<S>(stream: &mut S, buf: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}

// TcpTransport {{{
/// Frames carried over TCP, for RFCOMM-to-TCP bridges and serial servers.
pub struct TcpTransport {
    host: String,
    port: u16,
    read_timeout: Option<Duration>,
    stream: Option<tokio::net::TcpStream>,
    pending: BytesMut,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16, read_timeout: Option<Duration>) -> Self {
        Self {
            host: host.to_owned(),
            port,
            read_timeout,
            stream: None,
            pending: BytesMut::new(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<()> {
        self.close().await;

        let stream = match tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            tokio::net::TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(IoError::new(
                    ErrorKind::TimedOut,
                    format!("connect timeout after {} seconds", CONNECT_TIMEOUT_SECS),
                )
                .into())
            }
        };

        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
            warn!("Failed to set TCP keepalive: {}", e);
        }
        let stream = tokio::net::TcpStream::from_std(std_stream)?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        info!("connected to {}:{}", self.host, self.port);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) {
        self.pending.clear();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        write_and_flush(stream, buf).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        read_with_timeout(stream, &mut self.pending, buf, self.read_timeout).await
    }
} // }}}

// DeviceTransport {{{
/// Frames carried over a character device, typically an RFCOMM tty bound
/// with `rfcomm bind`.
pub struct DeviceTransport {
    path: PathBuf,
    read_timeout: Option<Duration>,
    file: Option<tokio::fs::File>,
    pending: BytesMut,
}

impl DeviceTransport {
    pub fn new(path: impl Into<PathBuf>, read_timeout: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            read_timeout,
            file: None,
            pending: BytesMut::new(),
        }
    }
}

#[async_trait]
impl Transport for DeviceTransport {
    async fn open(&mut self) -> Result<()> {
        self.close().await;

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;

        info!("opened {}", self.path.display());
        self.file = Some(file);
        Ok(())
    }

    async fn close(&mut self) {
        self.pending.clear();
        self.file = None;
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(not_open)?;
        write_and_flush(file, buf).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(not_open)?;
        read_with_timeout(file, &mut self.pending, buf, self.read_timeout).await
    }
} // }}}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write_all(buf).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact(buf).await
    }
}
