use std::fmt::{Debug, Display, Formatter};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::TunnelConfig;
use crate::packet::packet::{Packet, MAX_PACKET_SIZE, OPT_SIZE_CMD};
use crate::pool::buffer_pool::PooledBuf;
use crate::pool::SessionPools;
use crate::util::safe_converter::SafeCast;

/// Connection-level failures that callers branch on. They travel inside [anyhow::Error] and are
///  recognized by [is_timeout], [is_malformed] and [is_closed].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnError {
    /// the connection was closed, locally or by the peer
    Closed,
    Timeout,
    /// a frame with a known boundary that is not a valid packet: it was skipped, and the next
    ///  frame can be read
    Malformed(String),
    /// a size prefix beyond the maximum packet size: framing can not be trusted any more
    FrameTooLarge(usize),
}

impl Display for ConnError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnError::Closed => write!(f, "connection closed"),
            ConnError::Timeout => write!(f, "connection timed out"),
            ConnError::Malformed(reason) => write!(f, "malformed packet: {}", reason),
            ConnError::FrameTooLarge(size) => write!(f, "frame of {} bytes exceeds the maximum packet size of {}", size, MAX_PACKET_SIZE),
        }
    }
}

impl std::error::Error for ConnError {}

pub fn is_timeout(e: &anyhow::Error) -> bool {
    if let Some(ConnError::Timeout) = e.downcast_ref::<ConnError>() {
        return true;
    }
    matches!(e.downcast_ref::<std::io::Error>(), Some(io) if io.kind() == ErrorKind::TimedOut)
}

pub fn is_malformed(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<ConnError>(), Some(ConnError::Malformed(_)))
}

pub fn is_closed(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<ConnError>(), Some(ConnError::Closed))
}

/// Resolves once the connection it was taken from is closed (or dropped). It does not keep the
///  connection alive.
pub struct ClosedSignal(watch::Receiver<bool>);

impl ClosedSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|c| *c).await;
    }
}

/// Anything a tunnel connection can run over: TCP streams in production, in-memory duplex pipes
///  in tests
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl <T: AsyncRead + AsyncWrite + Send + Unpin + 'static> TunnelStream for T {}

type BoxedStream = Box<dyn TunnelStream>;

/// Splits the incoming byte stream into packets, using a read buffer that is held for the
///  connection's lifetime so that bytes of a partially received frame survive between reads.
struct FrameReader {
    half: ReadHalf<BoxedStream>,
    buf: PooledBuf,
    start: usize,
    end: usize,
}

impl FrameReader {
    fn buffered(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Returns the length of the next frame if it is completely buffered
    fn next_frame_len(&self) -> Result<Option<usize>, ConnError> {
        let buffered = self.buffered();
        if buffered.len() < 2 {
            return Ok(None);
        }
        let frame_len = 2 + u16::from_be_bytes([buffered[0], buffered[1]]).safe_cast();
        if frame_len > MAX_PACKET_SIZE {
            return Err(ConnError::FrameTooLarge(frame_len));
        }
        if buffered.len() < frame_len {
            return Ok(None);
        }
        Ok(Some(frame_len))
    }

    fn compact(&mut self) {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
        else if self.end == self.buf.len() {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Cancel safe: a frame is consumed from the buffer only when it is returned
    async fn read_frame(&mut self, pools: &SessionPools) -> anyhow::Result<Packet<PooledBuf>> {
        loop {
            if let Some(frame_len) = self.next_frame_len()? {
                let frame_start = self.start;
                self.start += frame_len;
                let frame = &self.buf[frame_start..frame_start + frame_len];

                if frame_len < 2 + OPT_SIZE_CMD {
                    return Err(ConnError::Malformed(format!("frame of {} bytes is shorter than a command packet", frame_len)).into());
                }

                let mut packet_buf = pools.packets.allocate(frame_len)?;
                packet_buf.extend_from_slice(frame);
                return Packet::from_bytes(packet_buf)
                    .map_err(|e| ConnError::Malformed(e.to_string()).into());
            }

            self.compact();
            let end = self.end;
            let num_read = self.half.read(&mut self.buf[end..]).await?;
            if num_read == 0 {
                debug!("connection closed by peer");
                return Err(ConnError::Closed.into());
            }
            trace!("read {} bytes", num_read);
            self.end += num_read;
        }
    }
}

/// A packet-framed connection with bounded reads and writes. Closing it wakes up every pending
///  read and write, which then fail with [ConnError::Closed].
pub struct TunnelConn {
    peer: String,
    pools: Arc<SessionPools>,
    reader: Mutex<Option<FrameReader>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    read_timeout: Duration,
    write_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl Debug for TunnelConn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelConn{{peer:{}, closed:{}}}", self.peer, self.is_closed())
    }
}

impl TunnelConn {
    pub fn new(stream: impl TunnelStream, peer: impl Into<String>, config: &TunnelConfig, pools: Arc<SessionPools>) -> anyhow::Result<TunnelConn> {
        // a complete frame must always fit the read buffer
        if pools.read_buffers.buf_size() < MAX_PACKET_SIZE {
            bail!("read buffer size {} is smaller than the maximum packet size {}", pools.read_buffers.buf_size(), MAX_PACKET_SIZE);
        }
        let mut read_buf = pools.read_buffers.allocate(pools.read_buffers.buf_size())?;
        let capacity = read_buf.capacity();
        read_buf.resize(capacity, 0);

        let stream: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);

        Ok(TunnelConn {
            peer: peer.into(),
            pools,
            reader: Mutex::new(Some(FrameReader {
                half: read_half,
                buf: read_buf,
                start: 0,
                end: 0,
            })),
            writer: Mutex::new(Some(write_half)),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            closed: watch::Sender::new(false),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn pools(&self) -> &Arc<SessionPools> {
        &self.pools
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// returns once the connection is closed
    pub async fn wait_closed(&self) {
        self.closed_signal().wait().await
    }

    pub fn closed_signal(&self) -> ClosedSignal {
        ClosedSignal(self.closed.subscribe())
    }

    /// Reads the next complete packet, waiting at most for the read timeout. Concurrent calls are
    ///  served one after the other.
    pub async fn read_packet(&self) -> anyhow::Result<Packet<PooledBuf>> {
        let mut reader = self.reader.lock().await;
        let Some(frame_reader) = reader.as_mut()
        else {
            return Err(ConnError::Closed.into());
        };

        let result = select! {
            r = timeout(self.read_timeout, frame_reader.read_frame(&self.pools)) => match r {
                Ok(r) => r,
                Err(_) => Err(ConnError::Timeout.into()),
            },
            _ = self.wait_closed() => Err(ConnError::Closed.into()),
        };

        if let Err(e) = &result {
            if matches!(e.downcast_ref::<ConnError>(), Some(ConnError::FrameTooLarge(_)) | Some(ConnError::Closed)) {
                *reader = None;
            }
        }
        result
    }

    /// Writes a complete packet. A write that fails or times out may have written part of the
    ///  packet, leaving the peer's framing broken, so the connection is closed.
    pub async fn write_packet(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(write_half) = writer.as_mut()
        else {
            return Err(ConnError::Closed.into());
        };

        let result: anyhow::Result<()> = select! {
            r = timeout(self.write_timeout, async {
                write_half.write_all(data).await?;
                write_half.flush().await
            }) => match r {
                Ok(r) => r.map_err(Into::into),
                Err(_) => Err(ConnError::Timeout.into()),
            },
            _ = self.wait_closed() => Err(ConnError::Closed.into()),
        };

        if let Err(e) = &result {
            if !is_closed(e) {
                debug!(peer = %self.peer, "write failed, closing connection: {}", e);
                *writer = None;
                drop(writer);
                self.close().await;
            }
        }
        result
    }

    /// Closes the connection. Returns `false` if it was closed before.
    pub async fn close(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        if was_closed {
            return false;
        }
        debug!(peer = %self.peer, "closing connection");

        // pending reads and writes see the closed flag and release their locks
        if let Some(mut write_half) = self.writer.lock().await.take() {
            let _ = timeout(self.write_timeout, write_half.shutdown()).await;
        }
        self.reader.lock().await.take();
        true
    }
}
