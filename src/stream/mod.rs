// ABOUTME: Playback streams layered on the connection bridge
// ABOUTME: Stream registration, state tracking, write-request servicing, and cork/drain control

mod sample;

pub use sample::{SampleFormat, SampleSpec, DEFAULT_NUM_CHANNELS, DEFAULT_SAMPLE_RATE};

use crate::bridge::{register, unregister, Connection, ConnectionInner, Handle, Registered, Request};
use crate::error::Error;
use crate::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Stream creation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamFlags(u32);

impl StreamFlags {
    /// No flags
    pub const NONE: StreamFlags = StreamFlags(0x0000_0000);
    /// Create the stream corked; it must be uncorked before audio plays
    pub const START_CORKED: StreamFlags = StreamFlags(0x0000_0001);
    /// Interpolate the latency for this stream
    pub const INTERPOLATE_TIMING: StreamFlags = StreamFlags(0x0000_0002);
    /// Don't force the time to increase monotonically
    pub const NOT_MONOTONIC: StreamFlags = StreamFlags(0x0000_0004);
    /// Issue timing update requests periodically
    pub const AUTO_TIMING_UPDATE: StreamFlags = StreamFlags(0x0000_0008);
    /// Map channels by index instead of by name
    pub const NO_REMAP_CHANNELS: StreamFlags = StreamFlags(0x0000_0010);
    /// Don't upmix or downmix when remapping channels by name
    pub const NO_REMIX_CHANNELS: StreamFlags = StreamFlags(0x0000_0020);
    /// Use the sample format of the device
    pub const FIX_FORMAT: StreamFlags = StreamFlags(0x0000_0040);
    /// Use the sample rate of the device
    pub const FIX_RATE: StreamFlags = StreamFlags(0x0000_0080);
    /// Use the channel count and map of the device
    pub const FIX_CHANNELS: StreamFlags = StreamFlags(0x0000_0100);
    /// Don't allow moving the stream to another device
    pub const DONT_MOVE: StreamFlags = StreamFlags(0x0000_0200);
    /// Allow changing the sample rate during playback
    pub const VARIABLE_RATE: StreamFlags = StreamFlags(0x0000_0400);
    /// Find peaks instead of resampling
    pub const PEAK_DETECT: StreamFlags = StreamFlags(0x0000_0800);
    /// Create in muted state
    pub const START_MUTED: StreamFlags = StreamFlags(0x0000_1000);
    /// Adjust device latency to the requested buffer metrics
    pub const ADJUST_LATENCY: StreamFlags = StreamFlags(0x0000_2000);
    /// Fragment-style playback for legacy clients
    pub const EARLY_REQUESTS: StreamFlags = StreamFlags(0x0000_4000);
    /// Don't prevent the device from auto-suspending
    pub const DONT_INHIBIT_AUTO_SUSPEND: StreamFlags = StreamFlags(0x0000_8000);
    /// Create in unmuted state
    pub const START_UNMUTED: StreamFlags = StreamFlags(0x0001_0000);
    /// Fail if the device is suspended while the stream is created
    pub const FAIL_ON_SUSPEND: StreamFlags = StreamFlags(0x0002_0000);
    /// Treat a passed volume as relative to the device volume
    pub const RELATIVE_VOLUME: StreamFlags = StreamFlags(0x0004_0000);
    /// Content is rendered by passthrough sinks
    pub const PASSTHROUGH: StreamFlags = StreamFlags(0x0008_0000);

    /// Raw bit set
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StreamFlags {
    type Output = StreamFlags;

    fn bitor(self, rhs: StreamFlags) -> StreamFlags {
        StreamFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for StreamFlags {
    fn bitor_assign(&mut self, rhs: StreamFlags) {
        self.0 |= rhs.0;
    }
}

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Not connected yet
    Unconnected,
    /// Being created on the server
    Creating,
    /// Established and usable
    Ready,
    /// Failed or was killed by the server
    Failed,
    /// Closed cleanly
    Terminated,
}

impl StreamState {
    /// Decode the foreign side's raw state value
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(StreamState::Unconnected),
            1 => Some(StreamState::Creating),
            2 => Some(StreamState::Ready),
            3 => Some(StreamState::Failed),
            4 => Some(StreamState::Terminated),
            _ => None,
        }
    }

    /// Raw value as used by the foreign side
    pub fn as_raw(self) -> i32 {
        match self {
            StreamState::Unconnected => 0,
            StreamState::Creating => 1,
            StreamState::Ready => 2,
            StreamState::Failed => 3,
            StreamState::Terminated => 4,
        }
    }

    /// Whether no further transitions can happen
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Ready | StreamState::Failed | StreamState::Terminated
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Unconnected => "unconnected",
            StreamState::Creating => "creating",
            StreamState::Ready => "ready",
            StreamState::Failed => "failed",
            StreamState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Byte FIFO shared between a stream's writer side and its write callback
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<VecDeque<u8>>>);

impl SharedBuffer {
    fn with_capacity(capacity: usize) -> Self {
        SharedBuffer(Arc::new(Mutex::new(VecDeque::with_capacity(capacity))))
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

impl Read for SharedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queue = self.0.lock();
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().extend(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct StreamStatus {
    raw: i32,
    error: Option<String>,
}

pub(crate) struct StreamInner {
    handle: Handle,
    name: String,
    pub(crate) connection: Arc<ConnectionInner>,
    status: Mutex<StreamStatus>,
    source: Mutex<Box<dyn Read + Send>>,
}

impl StreamInner {
    pub(crate) fn state_changed(&self, raw: i32, message: Option<&str>) {
        let mut status = self.status.lock();
        status.raw = raw;
        status.error = message.filter(|m| !m.is_empty()).map(str::to_string);
        match StreamState::from_raw(raw) {
            Some(state) => log::debug!("Stream '{}' is now {}", self.name, state),
            None => log::warn!("Stream '{}' reported unknown state {}", self.name, raw),
        }
    }

    /// Service one write request: a single read from the source, handed to the server
    pub(crate) fn fill(&self, length: usize) -> usize {
        if length == 0 {
            return 0;
        }
        let mut chunk = vec![0u8; length];
        let n = match self.source.lock().read(&mut chunk) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Stream '{}' source read failed: {}", self.name, e);
                return 0;
            }
        };
        if n == 0 {
            return 0;
        }

        if !self.connection.context.stream_write(&self.handle, &chunk[..n]) {
            let reason = self
                .connection
                .context
                .last_error()
                .unwrap_or_else(|| "unknown error".to_string());
            log::warn!("Write of {} bytes to stream '{}' failed: {}", n, self.name, reason);
            return 0;
        }
        log::trace!("Stream '{}' wrote {}/{} requested bytes", self.name, n, length);
        n
    }

    fn state(&self) -> (i32, Option<String>) {
        let status = self.status.lock();
        (status.raw, status.error.clone())
    }
}

/// A playback stream on a [`Connection`]
///
/// Audio written through [`io::Write`] is buffered and handed to the server
/// whenever it asks for more data, unless another source was installed with
/// [`Stream::with_source`]. Dropping the stream disconnects it.
pub struct Stream {
    inner: Arc<StreamInner>,
    conn: Connection,
    spec: SampleSpec,
    flags: StreamFlags,
    buffer: SharedBuffer,
    destroyed: bool,
}

impl Stream {
    /// Create a playback stream and wait until the server reports it ready
    ///
    /// `spec` defaults to the connection's configured sample spec.
    pub fn playback(
        conn: &Connection,
        name: &str,
        spec: Option<SampleSpec>,
        flags: StreamFlags,
    ) -> Result<Stream> {
        let spec = spec.unwrap_or(conn.config().sample_spec);
        if !spec.is_valid() {
            return Err(Error::Stream(format!("invalid sample spec {:?}", spec)));
        }

        let buffer = SharedBuffer::with_capacity(conn.config().buffer_size);
        let inner = Arc::new(StreamInner {
            handle: Handle::new(),
            name: name.to_string(),
            connection: Arc::clone(&conn.inner),
            status: Mutex::new(StreamStatus {
                raw: StreamState::Unconnected.as_raw(),
                error: None,
            }),
            source: Mutex::new(Box::new(buffer.clone())),
        });
        register(&inner.handle, Registered::Stream(Arc::clone(&inner)));

        let mut stream = Stream {
            inner,
            conn: conn.clone(),
            spec,
            flags,
            buffer,
            destroyed: false,
        };

        if let Err(e) = conn.lock_func(|| stream.connect()) {
            stream.release();
            return Err(e);
        }
        log::info!("Playback stream '{}' ready ({} {} Hz x{})", name, spec.format, spec.sample_rate, spec.channels);
        Ok(stream)
    }

    fn connect(&self) -> Result<()> {
        let context = &self.conn.inner.context;
        if !context.stream_connect_playback(&self.inner.handle, &self.inner.name, &self.spec, self.flags) {
            return Err(Error::Stream(
                self.conn
                    .last_error()
                    .unwrap_or_else(|| "stream connection refused".to_string()),
            ));
        }

        loop {
            let (raw, error) = self.inner.state();
            match StreamState::from_raw(raw) {
                Some(StreamState::Unconnected | StreamState::Creating) => self.conn.wait()?,
                Some(StreamState::Ready) => return Ok(()),
                Some(StreamState::Failed) => {
                    return Err(Error::Stream(
                        error
                            .or_else(|| self.conn.last_error())
                            .unwrap_or_else(|| "stream failed".to_string()),
                    ))
                }
                Some(StreamState::Terminated) => {
                    return Err(Error::Stream("stream was terminated during setup".to_string()))
                }
                None => return Err(Error::Stream(format!("unknown stream state {}", raw))),
            }
        }
    }

    /// Replace the data source read when the server requests audio
    pub fn with_source(self, source: impl Read + Send + 'static) -> Self {
        *self.inner.source.lock() = Box::new(source);
        self
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Handle identifying this stream to the foreign side
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Sample spec the stream was opened with
    pub fn sample_spec(&self) -> SampleSpec {
        self.spec
    }

    /// Flags the stream was opened with
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    /// Last state reported by the server
    pub fn state(&self) -> Option<StreamState> {
        StreamState::from_raw(self.inner.state().0)
    }

    /// Bytes written but not yet requested by the server
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the stream is corked (paused)
    pub fn is_corked(&self) -> bool {
        self.conn
            .lock_func(|| Ok(self.conn.inner.context.stream_is_corked(&self.inner.handle)))
            .unwrap_or(false)
    }

    /// Pause the stream; a no-op when already corked
    pub fn cork(&self) -> Result<()> {
        self.set_corked(true)
    }

    /// Resume the stream; a no-op when not corked
    pub fn uncork(&self) -> Result<()> {
        self.set_corked(false)
    }

    fn set_corked(&self, cork: bool) -> Result<()> {
        let mut operation = self.conn.new_operation().unbounded();
        if self.conn.inner.context.stream_is_corked(&self.inner.handle) == cork {
            return Ok(());
        }
        operation.submit(Request::StreamCork {
            stream: self.inner.handle.clone(),
            cork,
        })?;
        log::debug!("Waiting for stream '{}' {}", self.name(), if cork { "corked" } else { "uncorked" });
        operation.wait()
    }

    /// Block until everything buffered so far has been played
    pub fn drain(&self) -> Result<()> {
        let mut operation = self.conn.new_operation().unbounded();
        operation.submit(Request::StreamDrain {
            stream: self.inner.handle.clone(),
        })?;
        log::debug!("Waiting for stream '{}' drained", self.name());
        operation.wait()
    }

    /// Disconnect the stream and release its handle
    pub fn destroy(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let _ = self.conn.lock_func(|| {
            self.conn.inner.context.stream_disconnect(&self.inner.handle);
            unregister(&self.inner.handle);
            Ok(())
        });
    }
}

impl Write for Stream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buffer.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &self.inner.handle)
            .field("name", &self.inner.name)
            .field("spec", &self.spec)
            .finish()
    }
}

/// Play everything `data` yields on a new stream, returning once it has drained
pub fn play(conn: &Connection, name: &str, spec: Option<SampleSpec>, mut data: impl Read) -> Result<()> {
    let mut stream = Stream::playback(conn, name, spec, StreamFlags::START_CORKED)?;
    let copied = io::copy(&mut data, &mut stream)?;
    log::debug!("Queued {} bytes on stream '{}'", copied, name);

    stream
        .uncork()
        .map_err(|e| Error::Stream(format!("failed to uncork stream: {}", e)))?;
    stream
        .drain()
        .map_err(|e| Error::Stream(format!("failed to drain stream: {}", e)))?;
    stream.destroy();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::loopback::LoopbackServer;

    #[test]
    fn test_flags_combine() {
        let flags = StreamFlags::START_CORKED | StreamFlags::ADJUST_LATENCY;
        assert!(flags.contains(StreamFlags::START_CORKED));
        assert!(!flags.contains(StreamFlags::DONT_MOVE));
        assert_eq!(flags.bits(), 0x2001);
    }

    #[test]
    fn test_state_raw_values() {
        for raw in 0..5 {
            assert_eq!(StreamState::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(StreamState::from_raw(9), None);
        assert!(!StreamState::Creating.is_terminal());
    }

    #[test]
    fn test_shared_buffer_fifo() {
        let mut buffer = SharedBuffer::default();
        buffer.write_all(b"abcdef").unwrap();

        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out).unwrap(), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.read(&mut out).unwrap(), 2);
        assert_eq!(buffer.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_playback_write_and_drain() {
        let server = LoopbackServer::new();
        let conn = Connection::connect(&server, ClientConfig::new("stream-test")).unwrap();

        let mut stream = Stream::playback(&conn, "tone", None, StreamFlags::START_CORKED).unwrap();
        assert_eq!(stream.state(), Some(StreamState::Ready));
        assert!(stream.is_corked());

        stream.write_all(&[7u8; 10_000]).unwrap();
        stream.uncork().unwrap();
        assert!(!stream.is_corked());
        stream.drain().unwrap();

        assert_eq!(stream.buffered(), 0);
        assert_eq!(server.played_bytes("tone"), 10_000);
        stream.destroy();
        conn.disconnect();
    }

    #[test]
    fn test_playback_failure_unregisters() {
        let server = LoopbackServer::new().fail_streams("no such sink");
        let conn = Connection::connect(&server, ClientConfig::new("stream-test")).unwrap();

        match Stream::playback(&conn, "doomed", None, StreamFlags::NONE) {
            Err(Error::Stream(msg)) => assert_eq!(msg, "no such sink"),
            other => panic!("expected stream error, got {:?}", other),
        }
        assert!(!conn.is_locked());
        conn.disconnect();
    }
}
