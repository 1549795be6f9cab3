use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codes::MspCode;
use crate::device::DeviceState;
use crate::error::{Error, Result};
use crate::packets::{self, Direction, Frame};

/// Queries sent, in order, to identify a device before applying defaults.
pub const IDENTIFY_SEQUENCE: [MspCode; 5] = [
    MspCode::ApiVersion,
    MspCode::FcVariant,
    MspCode::FcVersion,
    MspCode::BuildInfo,
    MspCode::BoardInfo,
];

/// # MSP link over a serial byte stream
///
/// The link is half-duplex: every request is written, then response frames
/// are read until the matching one arrives. It owns the stream exclusively
/// for as long as it lives.
///
/// Any `AsyncRead + AsyncWrite` stream works, which is a
/// [`SerialStream`](tokio_serial::SerialStream) in production and a
/// [`tokio::io::duplex`] pipe in tests.
pub struct MspLink<T> {
    port: T,
}

impl<T: AsyncRead + AsyncWrite + Unpin> MspLink<T> {
    /// Wrap an open stream.
    pub fn new(port: T) -> Self {
        MspLink { port }
    }

    /// Give the stream back.
    pub fn into_inner(self) -> T {
        self.port
    }

    /// The underlying stream, for unframed CLI traffic.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.port
    }

    /// Write raw bytes, bypassing MSP framing
    ///
    /// Used for CLI-mode commands such as `#\n` and `bl\n`.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes).await?;
        self.port.flush().await?;
        Ok(())
    }

    /// Encode and send one request frame.
    ///
    /// # Arguments
    ///
    /// * `code` - The command to send
    /// * `data` - Request payload, empty for plain queries
    pub async fn send(&mut self, code: MspCode, data: &[u8]) -> Result<()> {
        tracing::debug!(%code, len = data.len(), "MSP send");
        self.send_raw(&packets::encode(code.code(), data)).await
    }

    /// Read the next response frame from the stream
    ///
    /// Bytes are consumed one at a time until the preamble `$`, `M`, `>` (or
    /// `!` for an unsupported-command reply) is seen in sequence; then the
    /// length byte and the remaining `length + 2` bytes are read.
    ///
    /// This waits as long as the stream does. Use [`request`](Self::request)
    /// to bound the wait.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut matched = 0usize;
        let direction = loop {
            let byte = self.port.read_u8().await?;
            match (matched, byte) {
                (0, b'$') => matched = 1,
                (1, b'M') => matched = 2,
                (2, b'>') => break Direction::Response,
                (2, b'!') => break Direction::Unsupported,
                (_, b'$') => matched = 1,
                _ => matched = 0,
            }
        };

        let length = self.port.read_u8().await?;
        let mut raw = Vec::with_capacity(packets::FRAME_OVERHEAD + length as usize);
        raw.extend_from_slice(&packets::PREAMBLE);
        raw.push(direction.marker());
        raw.push(length);
        let header = raw.len();
        raw.resize(header + length as usize + 2, 0);
        self.port.read_exact(&mut raw[header..]).await?;

        let frame = packets::decode_frame(&raw)?;
        tracing::debug!(%frame, "MSP receive");
        Ok(frame)
    }

    /// Send a request and wait for its response
    ///
    /// Frames answering other commands are skipped.
    ///
    /// # Arguments
    ///
    /// * `code` - The command to send
    /// * `data` - Request payload
    /// * `timeout` - Maximum time to wait for the matching response
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no matching frame arrives in time.
    pub async fn request(&mut self, code: MspCode, data: &[u8], timeout: Duration) -> Result<Frame> {
        self.send(code, data).await?;
        let wait = async {
            loop {
                let frame = self.read_frame().await?;
                if frame.code() == code {
                    return Ok::<_, Error>(frame);
                }
                tracing::debug!(expected = %code, got = %frame.code(), "skipping unrelated frame");
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| Error::Timeout(timeout))?
    }

    /// Send a query and fold the response into `state`.
    pub async fn query(&mut self, state: &mut DeviceState, code: MspCode, timeout: Duration) -> Result<()> {
        let frame = self.request(code, &[], timeout).await?;
        state.decode(&frame)
    }

    /// Run the identification queries of [`IDENTIFY_SEQUENCE`] in order.
    ///
    /// The api-version query comes first so board-info decoding is gated on
    /// the real version.
    pub async fn identify(&mut self, state: &mut DeviceState, timeout: Duration) -> Result<()> {
        for code in IDENTIFY_SEQUENCE {
            self.query(state, code, timeout).await?;
        }
        Ok(())
    }

    /// Ask the device for its board name.
    ///
    /// Used to pick a firmware target when none is given.
    pub async fn detect_board_name(&mut self, timeout: Duration) -> Result<String> {
        let mut state = DeviceState::new();
        self.query(&mut state, MspCode::BoardInfo, timeout).await?;
        Ok(state.board_name)
    }
}
