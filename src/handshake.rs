use crate::Error;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use sha1_smol::Sha1;
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_REQUEST_HEAD: usize = 8 * 1024;
const NONCE_LEN: usize = 16;

/// The head of the client's HTTP/1.1 upgrade request.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    headers: HashMap<String, String>,
}

impl Request {
    pub fn parse(head: &str) -> Result<Request, Error> {
        let mut lines = head.lines();

        let request_line = lines.next().unwrap_or("");
        let mut split = request_line.split_ascii_whitespace();
        let (Some(method), Some(path), Some("HTTP/1.1"), None) =
            (split.next(), split.next(), split.next(), split.next())
        else {
            return Err(Error::UnexpectedRequest(request_line.into()));
        };

        let mut headers: HashMap<String, String> = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }

            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::InvalidHeaderLine(line.into()));
            };

            // repeated headers fold into a comma-separated list
            headers
                .entry(name.trim().to_ascii_lowercase())
                .and_modify(|joined| {
                    joined.push_str(", ");
                    joined.push_str(value.trim());
                })
                .or_insert_with(|| value.trim().to_string());
        }

        Ok(Request {
            method: method.into(),
            path: path.into(),
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }
}

/// The `Sec-WebSocket-Accept` value for a client key:
/// `base64(sha1(key || guid))`, with the raw key trimmed but not re-decoded.
pub fn accept_key(key: &str) -> String {
    let hash = Sha1::from(format!("{}{}", trim_ascii(key), ACCEPT_GUID))
        .digest()
        .bytes();
    BASE64.encode(hash)
}

/// Check the upgrade request against section 4.2.1 of the RFC and derive the
/// accept token from its key.
pub fn validate(request: &Request) -> Result<String, Error> {
    if request.method != "GET" {
        return Err(Error::UnexpectedRequest(format!(
            "method {}",
            request.method
        )));
    }

    if request.host().map_or(true, str::is_empty) {
        return Err(Error::MissingOrInvalidHeader("Host"));
    }

    if request
        .header("upgrade")
        .map(|upgrade| upgrade.eq_ignore_ascii_case("websocket"))
        != Some(true)
    {
        return Err(Error::MissingOrInvalidHeader("Upgrade"));
    }

    if request.header("connection").map(|connection| {
        connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    }) != Some(true)
    {
        return Err(Error::MissingOrInvalidHeader("Connection"));
    }

    match request.header("sec-websocket-version") {
        None => return Err(Error::MissingOrInvalidHeader("Sec-WebSocket-Version")),
        Some("13") => {}
        Some(version) => return Err(Error::UnsupportedVersion(version.into())),
    }

    let Some(key) = request.header("sec-websocket-key") else {
        return Err(Error::MissingOrInvalidHeader("Sec-WebSocket-Key"));
    };
    let nonce = BASE64.decode(trim_ascii(key)).map_err(|_| Error::BadKey)?;
    if nonce.len() != NONCE_LEN {
        return Err(Error::BadKey);
    }

    Ok(accept_key(key))
}

/// Run the server side of the opening handshake over `stream`, buffering
/// reads through `buffer`. Bytes the client sent past the request head stay
/// in `buffer` for the framing layer.
pub(crate) async fn accept<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<Request, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = match read_request_head(stream, buffer).await {
        Ok(head) => head,
        Err(err @ Error::Io(_)) => return Err(err),
        Err(err) => {
            respond_error(stream, &err).await?;
            return Err(err);
        }
    };

    let request = match Request::parse(&head) {
        Ok(request) => request,
        Err(err) => {
            respond_error(stream, &err).await?;
            return Err(err);
        }
    };

    match validate(&request) {
        Ok(token) => {
            let response = format!(
                concat!(
                    "HTTP/1.1 101 Switching Protocols\r\n",
                    "Upgrade: websocket\r\n",
                    "Connection: Upgrade\r\n",
                    "Sec-WebSocket-Accept: {}\r\n",
                    "\r\n",
                ),
                token,
            );
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;
            Ok(request)
        }
        Err(err) => {
            respond_error(stream, &err).await?;
            Err(err)
        }
    }
}

async fn respond_error<S>(stream: &mut S, err: &Error) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    debug!(error = %err, "rejecting websocket upgrade");

    let response = match err {
        Error::UnsupportedVersion(_) => concat!(
            "HTTP/1.1 426 Upgrade Required\r\n",
            "Sec-WebSocket-Version: 13\r\n",
            "Content-Length: 0\r\n",
            "\r\n",
        )
        .to_string(),
        _ => {
            let body = err.to_string();
            format!(
                concat!(
                    "HTTP/1.1 400 Bad Request\r\n",
                    "Content-Type: text/plain\r\n",
                    "Content-Length: {}\r\n",
                    "\r\n",
                    "{}",
                ),
                body.len(),
                body,
            )
        }
    };

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_request_head<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<String, Error>
where
    S: AsyncRead + Unpin,
{
    const CRLF_CRLF: &[u8] = b"\r\n\r\n";

    loop {
        if let Some(at) = buffer
            .windows(CRLF_CRLF.len())
            .position(|window| window == CRLF_CRLF)
        {
            let head = buffer.split_to(at + CRLF_CRLF.len());
            return match std::str::from_utf8(&head) {
                Ok(head) => Ok(head.to_string()),
                Err(_) => Err(Error::UnexpectedRequest(
                    "request head is not valid UTF-8".into(),
                )),
            };
        }

        if buffer.len() > MAX_REQUEST_HEAD {
            return Err(Error::UnexpectedRequest("request head too large".into()));
        }

        if stream.read_buf(buffer).await? == 0 {
            return Err(
                io::Error::new(io::ErrorKind::UnexpectedEof, "eof inside the request head").into(),
            );
        }
    }
}

fn trim_ascii(value: &str) -> &str {
    value.trim_matches(|c: char| c.is_ascii_whitespace())
}
