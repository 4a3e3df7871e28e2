//! Memcached ASCII protocol: `get` and `set` over one connection.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::error::{CacheError, Result};

/// Longest key memcached accepts.
pub const MAX_KEY_LENGTH: usize = 250;

/// Largest value length accepted from a server reply.
pub const MAX_VALUE_LENGTH: usize = 1 << 30;

/// Relative expirations above this are interpreted by memcached as unix
/// timestamps.
const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

/// Whether `key` can be sent on the wire unchanged: non-empty, at most 250
/// bytes, no whitespace or control characters.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key.bytes().all(|b| b > b' ' && b != 0x7f)
}

/// Converts a validity period into a memcached `exptime` field.
pub fn expiration(validity: Duration) -> u64 {
    let secs = validity.as_secs();
    if secs <= MAX_RELATIVE_EXPIRATION {
        return secs;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now + secs
}

/// A buffered connection to one memcached server.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: BufStream<S>,
    address: String,
    max_value_len: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S, address: impl Into<String>) -> Self {
        Self {
            stream: BufStream::new(stream),
            address: address.into(),
            max_value_len: MAX_VALUE_LENGTH,
        }
    }

    /// Rejects reply values longer than `limit` bytes (zero keeps the default).
    pub fn with_max_value_len(mut self, limit: usize) -> Self {
        if limit > 0 {
            self.max_value_len = limit.min(MAX_VALUE_LENGTH);
        }
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Issues one `get` for all `keys`; keys absent from the reply are misses.
    pub async fn get_multi(&mut self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut command = String::from("get");
        for key in keys {
            command.push(' ');
            command.push_str(key);
        }
        command.push_str("\r\n");
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.flush().await?;
        self.read_values().await
    }

    pub async fn set(&mut self, key: &str, value: &[u8], exptime: u64) -> Result<()> {
        let header = format!("set {key} 0 {exptime} {}\r\n", value.len());
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.write_all(value).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;

        match self.read_line().await?.as_str() {
            "STORED" => Ok(()),
            line => Err(reply_error(line)),
        }
    }

    async fn read_values(&mut self) -> Result<HashMap<String, Vec<u8>>> {
        let mut values = HashMap::new();
        loop {
            let line = self.read_line().await?;
            if line == "END" {
                return Ok(values);
            }
            let Some(header) = line.strip_prefix("VALUE ") else {
                return Err(reply_error(&line));
            };

            // VALUE <key> <flags> <bytes> [<cas unique>]
            let mut fields = header.split(' ');
            let (Some(key), Some(_flags), Some(len)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(CacheError::Protocol(format!("malformed value line: {line}")));
            };
            let len: usize = len
                .parse()
                .map_err(|_| CacheError::Protocol(format!("bad value length: {line}")))?;
            if len > self.max_value_len {
                return Err(CacheError::Protocol(format!(
                    "value length {len} exceeds limit {}",
                    self.max_value_len
                )));
            }

            let mut data = vec![0u8; len + 2];
            self.stream.read_exact(&mut data).await?;
            if !data.ends_with(b"\r\n") {
                return Err(CacheError::Protocol("value not terminated by CRLF".into()));
            }
            data.truncate(len);
            values.insert(key.to_string(), data);
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let read = self.stream.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            return Err(CacheError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

fn reply_error(line: &str) -> CacheError {
    if let Some(msg) = line.strip_prefix("SERVER_ERROR ") {
        CacheError::Protocol(format!("server error: {msg}"))
    } else if let Some(msg) = line.strip_prefix("CLIENT_ERROR ") {
        CacheError::Protocol(format!("client error: {msg}"))
    } else {
        CacheError::Protocol(format!("unexpected reply: {line}"))
    }
}
