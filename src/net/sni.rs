//! TLS ClientHello sniffing.
//!
//! Reads just enough of a connection to find the `server_name` extension,
//! then hands the bytes back so they can be replayed to the real reader.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;
/// Largest TLS record plus its header.
const MAX_HELLO_LEN: usize = RECORD_HEADER_LEN + 16_384;

/// Result of inspecting a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloParse {
    /// More bytes are needed.
    Incomplete,
    /// Not a TLS handshake record.
    NotTls,
    /// A complete ClientHello without a host name.
    NoSni,
    Sni(String),
}

/// Inspect the first TLS record in `buf`.
pub fn parse_client_hello(buf: &[u8]) -> HelloParse {
    if buf.len() < RECORD_HEADER_LEN {
        return HelloParse::Incomplete;
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE || buf[1] != 0x03 {
        return HelloParse::NotTls;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < RECORD_HEADER_LEN + record_len {
        return HelloParse::Incomplete;
    }

    let mut r = Reader::new(&buf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len]);
    match read_server_name(&mut r) {
        Some(Some(name)) => HelloParse::Sni(name),
        Some(None) => HelloParse::NoSni,
        None => HelloParse::NotTls,
    }
}

/// `None` on malformed input, `Some(None)` when the extension is absent.
fn read_server_name(r: &mut Reader<'_>) -> Option<Option<String>> {
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let _handshake_len = r.u24()?;
    r.skip(2 + 32)?; // client_version, random
    let session_id = r.u8()? as usize;
    r.skip(session_id)?;
    let suites = r.u16()? as usize;
    r.skip(suites)?;
    let compression = r.u8()? as usize;
    r.skip(compression)?;

    if r.is_empty() {
        return Some(None);
    }

    let extensions_len = r.u16()? as usize;
    let mut extensions = Reader::new(r.take(extensions_len)?);
    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let len = extensions.u16()? as usize;
        let data = extensions.take(len)?;
        if kind != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut list = Reader::new(data);
        let list_len = list.u16()? as usize;
        let mut names = Reader::new(list.take(list_len)?);
        while !names.is_empty() {
            let name_type = names.u8()?;
            let name_len = names.u16()? as usize;
            let name = names.take(name_len)?;
            if name_type == NAME_TYPE_HOST {
                return Some(std::str::from_utf8(name).ok().map(str::to_ascii_lowercase));
            }
        }
    }
    Some(None)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<u32> {
        self.take(3)
            .map(|b| u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

/// Read from `stream` until the ClientHello is complete, the peer stops
/// sending, or `timeout` passes. Returns the host name, if any, and every
/// byte consumed so it can be replayed.
pub async fn sniff<S>(stream: &mut S, timeout: Duration) -> std::io::Result<(Option<String>, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match parse_client_hello(&buf) {
                HelloParse::Incomplete if buf.len() < MAX_HELLO_LEN => {}
                HelloParse::Sni(name) => return Ok::<_, std::io::Error>(Some(name)),
                _ => return Ok(None),
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(None);
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(sni)) => Ok((sni, buf.freeze())),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::debug!(read = buf.len(), "ClientHello sniff timed out");
            Ok((None, buf.freeze()))
        }
    }
}
