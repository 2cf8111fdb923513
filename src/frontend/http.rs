use std::collections::HashMap;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_BODY: usize = 1 << 20;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Default)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

const MAX_LINE: usize = 8 << 10;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The request is refused with `status`; the connection stays usable
    /// for the answer.
    #[error("{message}")]
    Rejected { status: u16, message: &'static str },
}

fn rejected(status: u16, message: &'static str) -> RequestError {
    RequestError::Rejected { status, message }
}

/// Reads one line of at most `MAX_LINE` bytes into `line`.
async fn read_line<R>(reader: &mut R, line: &mut String) -> Result<usize, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader).take(MAX_LINE as u64).read_line(line).await?;
    if read == MAX_LINE && !line.ends_with('\n') {
        return Err(rejected(431, "request line or header too long"));
    }
    Ok(read)
}

/// Reads one request head and its `Content-Length` body. `None` when the
/// peer closed before sending anything. Chunked bodies are refused.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if read_line(reader, &mut line).await? == 0 {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(method), Some(target)) => (method.to_string(), target.to_string()),
        _ => return Err(rejected(400, "malformed request line")),
    };

    let mut content_length = 0;
    let mut header_end = false;
    for _ in 0..MAX_HEADERS {
        if read_line(reader, &mut line).await? == 0 {
            header_end = true;
            break;
        }
        let header = line.trim_end();
        if header.is_empty() {
            header_end = true;
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("transfer-encoding") {
                return Err(rejected(411, "send the body with a Content-Length"));
            }
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| rejected(400, "bad content-length"))?;
            }
        }
    }
    if !header_end {
        return Err(rejected(431, "too many headers"));
    }
    if content_length > MAX_BODY {
        return Err(rejected(413, "request body too large"));
    }

    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).await?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target, HashMap::new()),
    };

    Ok(Some(Request {
        method,
        path,
        query,
        body,
    }))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(status: u16, body: impl Into<String>) -> Response {
        Response {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Response {
        match serde_json::to_vec(value) {
            Ok(body) => Response {
                status: 200,
                content_type: "application/json",
                body,
            },
            Err(e) => Response::text(500, e.to_string()),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            reason(self.status),
            self.content_type,
            self.body.len()
        );
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        411 => "Length Required",
        413 => "Content Too Large",
        422 => "Unprocessable Entity",
        431 => "Request Header Fields Too Large",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}
