//! Server side of RFC 6455: the HTTP upgrade handshake and the framing layer
//! that runs over the stream afterwards.

pub mod frame;
pub mod handshake;

use frame::{close_code_valid, Frame, FrameCodec, Opcode};
use handshake::Request;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_BUFFERED: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected HTTP request: {0}")]
    UnexpectedRequest(String),
    #[error("invalid header line: {0}")]
    InvalidHeaderLine(String),
    #[error("missing or invalid header: {0}")]
    MissingOrInvalidHeader(&'static str),
    #[error("unsupported websocket version: {0}")]
    UnsupportedVersion(String),
    #[error("Sec-WebSocket-Key did not decode to a 16-byte nonce")]
    BadKey,
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid UTF-8 in a text payload")]
    InvalidUtf8,
    #[error("message exceeds the configured size limit")]
    MessageTooBig,
    #[error("the opening handshake has not completed")]
    HandshakePending,
    #[error("tried to use a closed websocket")]
    WasClosed,
}

impl From<FromUtf8Error> for Error {
    fn from(_: FromUtf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl Error {
    /// Close code sent to the peer when this error tears the connection down,
    /// or `None` when the transport is dropped without a close frame.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::Protocol(_) => Some(1002),
            Error::InvalidUtf8 => Some(1007),
            Error::MessageTooBig => Some(1009),
            Error::Io(err) if err.kind() == io::ErrorKind::TimedOut => Some(1011),
            _ => None,
        }
    }
}

/// A violation of the framing rules by the peer. Closes with code 1002.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bits are not zero")]
    NonZeroRsv,
    #[error("reserved opcode")]
    ReservedOpcode,
    #[error("client frame was not masked")]
    UnmaskedFrame,
    #[error("payload length is not minimally encoded")]
    NonMinimalLength,
    #[error("payload length high bit is set")]
    InvalidPayloadLength,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame payload over 125 bytes")]
    ControlFrameTooLong,
    #[error("continuation frame with no message in progress")]
    UnexpectedContinuation,
    #[error("data frame while another message is in progress")]
    UnfinishedMessage,
    #[error("close code not allowed on the wire")]
    InvalidCloseCode,
    #[error("close frame with a one-byte payload")]
    BadCloseFrame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// Code and reason carried by a peer's close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub struct WebSocket<Stream> {
    codec: FrameCodec<Stream>,
    state: State,
    partial: Option<(Opcode, Vec<u8>)>,
    request: Option<Request>,
    peer_close: Option<Close>,
}

impl<Stream> WebSocket<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a freshly accepted byte stream. The connection is not usable
    /// until [`accept`](Self::accept) has run the opening handshake.
    pub fn server(stream: Stream) -> Self {
        WebSocket {
            codec: FrameCodec::new(stream),
            state: State::Connecting,
            partial: None,
            request: None,
            peer_close: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The upgrade request, once the handshake has completed.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// Code and reason from the peer's close frame, if one was received.
    pub fn peer_close(&self) -> Option<&Close> {
        self.peer_close.as_ref()
    }

    pub fn set_max_message_size(&mut self, max: usize) {
        assert!(max > 0, "max message size must be nonzero");
        self.codec.max_payload = max;
    }

    /// Tolerate frames the client failed to mask instead of closing with a
    /// protocol error. Off by default; the RFC requires clients to mask.
    pub fn set_accept_unmasked_frames(&mut self, accept: bool) {
        self.codec.accept_unmasked = accept;
    }

    /// Run the server side of the opening handshake: read the client's
    /// upgrade request and reply 101, 400, or 426. On success the connection
    /// is open and frames may flow.
    pub async fn accept(&mut self) -> Result<(), Error> {
        if self.state != State::Connecting {
            return Err(Error::WasClosed);
        }

        match handshake::accept(&mut self.codec.stream, &mut self.codec.buffer).await {
            Ok(request) => {
                debug!(path = %request.path, "accepted websocket upgrade");
                self.request = Some(request);
                self.state = State::Open;
                Ok(())
            }
            Err(err) => {
                self.state = State::Closed;
                let _ = self.codec.shutdown().await;
                Err(err)
            }
        }
    }

    /// Read the next complete message, answering control frames along the
    /// way. `Ok(None)` means the stream ended cleanly: either the close
    /// handshake finished or the peer shut down between frames.
    pub async fn read(&mut self) -> Result<Option<Message>, Error> {
        match self.state {
            State::Connecting => return Err(Error::HandshakePending),
            State::Closing | State::Closed => return Ok(None),
            State::Open => {}
        }

        loop {
            let frame = match self.codec.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.state = State::Closed;
                    if self.partial.is_some() {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "eof inside a fragmented message",
                        )
                        .into());
                    }
                    return Ok(None);
                }
                Err(err) => return Err(self.fail(err).await),
            };

            match frame.opcode {
                Opcode::Ping => {
                    trace!(len = frame.payload.len(), "answering ping");
                    let pong = Frame::pong(frame.payload);
                    if let Err(err) = self.send_control(&pong).await {
                        self.state = State::Closed;
                        return Err(err);
                    }
                }

                Opcode::Pong => {}

                Opcode::Close => return self.on_close(frame).await,

                Opcode::Text | Opcode::Binary => {
                    if self.partial.is_some() {
                        return Err(self.fail(ProtocolError::UnfinishedMessage.into()).await);
                    }
                    if frame.fin {
                        return Ok(Some(self.deliver(frame.opcode, frame.payload).await?));
                    }
                    self.partial = Some((frame.opcode, frame.payload));
                }

                Opcode::Continuation => {
                    let Some((opcode, mut payload)) = self.partial.take() else {
                        return Err(self.fail(ProtocolError::UnexpectedContinuation.into()).await);
                    };
                    if payload.len() + frame.payload.len() > self.codec.max_payload {
                        return Err(self.fail(Error::MessageTooBig).await);
                    }
                    payload.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return Ok(Some(self.deliver(opcode, payload).await?));
                    }
                    self.partial = Some((opcode, payload));
                }
            }
        }
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), Error> {
        self.send_frame(Frame::text(text.as_bytes().to_vec())).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<(), Error> {
        self.send_frame(Frame::binary(data.to_vec())).await
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.codec.flush().await
    }

    /// Initiate the close handshake: send a close frame, discard incoming
    /// frames until the peer's close (or EOF), then shut the stream down.
    /// The close frame is the last frame written on the connection.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        match self.state {
            State::Connecting => return Err(Error::HandshakePending),
            State::Closing | State::Closed => return Err(Error::WasClosed),
            State::Open => {}
        }

        debug!(code, "closing connection");
        self.state = State::Closing;

        let frame = Frame::close(code, truncated(reason).as_bytes());
        if let Err(err) = self.send_control(&frame).await {
            self.state = State::Closed;
            return Err(err);
        }

        loop {
            match self.codec.read_frame().await {
                Ok(Some(frame)) if frame.opcode == Opcode::Close => {
                    if frame.payload.len() >= 2 {
                        let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                        let reason = String::from_utf8_lossy(&frame.payload[2..]).into_owned();
                        self.peer_close = Some(Close { code, reason });
                    }
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        let shutdown = self.codec.shutdown().await;
        self.state = State::Closed;
        shutdown
    }

    /// Drive the connection to completion, handing each message to
    /// `handler` and sending whatever it returns. The transport is released
    /// on every exit path.
    pub async fn serve<F>(mut self, mut handler: F) -> Result<(), Error>
    where
        F: FnMut(Message) -> Option<Message>,
    {
        loop {
            match self.read().await? {
                Some(message) => {
                    if let Some(reply) = handler(message) {
                        match reply {
                            Message::Text(text) => self.send_text(&text).await?,
                            Message::Binary(data) => self.send_binary(&data).await?,
                        }
                        self.flush().await?;
                    }
                }
                None => return Ok(()),
            }
        }
    }

    async fn deliver(&mut self, opcode: Opcode, payload: Vec<u8>) -> Result<Message, Error> {
        if opcode == Opcode::Text {
            match String::from_utf8(payload) {
                Ok(text) => Ok(Message::Text(text)),
                Err(_) => Err(self.fail(Error::InvalidUtf8).await),
            }
        } else {
            Ok(Message::Binary(payload))
        }
    }

    async fn on_close(&mut self, frame: Frame) -> Result<Option<Message>, Error> {
        self.state = State::Closing;

        let payload = frame.payload;
        let (reply_code, result): (u16, Result<Option<Message>, Error>) = if payload.is_empty() {
            (1000, Ok(None))
        } else if payload.len() == 1 {
            (1002, Err(ProtocolError::BadCloseFrame.into()))
        } else {
            // code validity first, then the reason's UTF-8
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !close_code_valid(code) {
                (1002, Err(ProtocolError::InvalidCloseCode.into()))
            } else {
                match std::str::from_utf8(&payload[2..]) {
                    Err(_) => (1007, Err(Error::InvalidUtf8)),
                    Ok(reason) => {
                        self.peer_close = Some(Close {
                            code,
                            reason: reason.to_string(),
                        });
                        (1000, Ok(None))
                    }
                }
            }
        };

        debug!(code = reply_code, "replying to close frame");
        let reply = Frame::close(reply_code, b"");
        if let Err(err) = self.send_control(&reply).await {
            self.state = State::Closed;
            return Err(err);
        }
        if let Err(err) = self.codec.shutdown().await {
            self.state = State::Closed;
            return Err(err);
        }

        self.codec.drain().await;
        self.state = State::Closed;
        result
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        match self.state {
            State::Connecting => Err(Error::HandshakePending),
            State::Closing | State::Closed => Err(Error::WasClosed),
            State::Open => self.codec.write_frame(&frame).await,
        }
    }

    async fn send_control(&mut self, frame: &Frame) -> Result<(), Error> {
        self.codec.write_frame(frame).await?;
        self.codec.flush().await
    }

    /// Best-effort close initiation after an error: send the mapped close
    /// code if there is one, then tear the transport down.
    async fn fail(&mut self, err: Error) -> Error {
        debug!(error = %err, "tearing down connection");

        if let Some(code) = err.close_code() {
            if self.state == State::Open {
                let reason = err.to_string();
                let frame = Frame::close(code, truncated(&reason).as_bytes());
                let _ = self.codec.write_frame(&frame).await;
                let _ = self.codec.flush().await;
            }
        }
        let _ = self.codec.shutdown().await;
        self.state = State::Closed;
        err
    }
}

/// Cut a close reason down to what fits in a control frame alongside the
/// two-byte code, on a character boundary.
fn truncated(reason: &str) -> &str {
    const MAX: usize = frame::MAX_CONTROL_PAYLOAD - 2;
    if reason.len() <= MAX {
        return reason;
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
