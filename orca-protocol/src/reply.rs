//! Byte-exact reply encoders for protocol versions 2 and 3.
//!
//! These functions only produce wire bytes; accumulation into per-client buffers and flush
//! scheduling live in the server crate. Version-dependent encodings take the negotiated
//! [`ProtocolVersion`] so command code never branches on raw version numbers.

/// Client-negotiated reply protocol version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Original protocol: nulls are typed sentinels, no map/set/bool/double types.
    #[default]
    Resp2,
    /// Extended protocol negotiated via `HELLO 3`.
    Resp3,
}

impl ProtocolVersion {
    /// Maps a HELLO protover argument to a version.
    #[must_use]
    pub fn from_number(number: i64) -> Option<Self> {
        match number {
            2 => Some(Self::Resp2),
            3 => Some(Self::Resp3),
            _ => None,
        }
    }

    /// The numeric form reported back to clients.
    #[must_use]
    pub fn as_number(self) -> i64 {
        match self {
            Self::Resp2 => 2,
            Self::Resp3 => 3,
        }
    }
}

/// Aggregate container kinds with version-dependent header sigils.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Array,
    Map,
    Set,
    Attribute,
    Push,
}

impl AggregateKind {
    /// Header sigil for this kind under the given protocol version.
    ///
    /// Version 2 has only arrays, so the richer kinds downgrade to `*`.
    #[must_use]
    pub fn prefix(self, version: ProtocolVersion) -> u8 {
        match (self, version) {
            (Self::Array, _)
            | (Self::Map | Self::Set | Self::Attribute | Self::Push, ProtocolVersion::Resp2) => {
                b'*'
            }
            (Self::Map, ProtocolVersion::Resp3) => b'%',
            (Self::Set, ProtocolVersion::Resp3) => b'~',
            (Self::Attribute, ProtocolVersion::Resp3) => b'|',
            (Self::Push, ProtocolVersion::Resp3) => b'>',
        }
    }

    /// Element count as written on the wire: maps and attributes downgraded to version-2 arrays
    /// carry each pair as two flat elements.
    #[must_use]
    pub fn wire_count(self, version: ProtocolVersion, count: i64) -> i64 {
        match (self, version) {
            (Self::Map | Self::Attribute, ProtocolVersion::Resp2) => count.saturating_mul(2),
            _ => count,
        }
    }
}

/// Formats `<prefix><count>\r\n`, the header of every aggregate and bulk reply.
#[must_use]
pub fn header(prefix: u8, count: i64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(24);
    bytes.push(prefix);
    bytes.extend_from_slice(count.to_string().as_bytes());
    bytes.extend_from_slice(b"\r\n");
    bytes
}

/// Formats an aggregate header for the given kind, honoring version downgrades.
#[must_use]
pub fn aggregate_header(version: ProtocolVersion, kind: AggregateKind, count: i64) -> Vec<u8> {
    header(kind.prefix(version), kind.wire_count(version, count))
}

/// Formats `+<text>\r\n`.
#[must_use]
pub fn simple_string(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 3);
    bytes.push(b'+');
    bytes.extend_from_slice(text.as_bytes());
    bytes.extend_from_slice(b"\r\n");
    bytes
}

/// Formats an error reply.
///
/// When the caller text already starts with `-` the error code is taken to be provided
/// (`-CODE message`); otherwise `-ERR ` is prepended. Only the first byte is inspected;
/// dispatcher code depends on this exact heuristic.
#[must_use]
pub fn error(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 8);
    if !text.starts_with('-') {
        bytes.extend_from_slice(b"-ERR ");
    }
    bytes.extend_from_slice(text.as_bytes());
    bytes.extend_from_slice(b"\r\n");
    bytes
}

/// Formats `:<value>\r\n`.
#[must_use]
pub fn integer(value: i64) -> Vec<u8> {
    header(b':', value)
}

/// Formats `$<len>\r\n<payload>\r\n`.
#[must_use]
pub fn bulk(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + 16);
    bytes.push(b'$');
    bytes.extend_from_slice(payload.len().to_string().as_bytes());
    bytes.extend_from_slice(b"\r\n");
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(b"\r\n");
    bytes
}

/// Null reply: `$-1\r\n` in version 2, `_\r\n` in version 3.
#[must_use]
pub fn null(version: ProtocolVersion) -> &'static [u8] {
    match version {
        ProtocolVersion::Resp2 => b"$-1\r\n",
        ProtocolVersion::Resp3 => b"_\r\n",
    }
}

/// Null array reply: `*-1\r\n` in version 2; version 3 collapses it into the plain null.
#[must_use]
pub fn null_array(version: ProtocolVersion) -> &'static [u8] {
    match version {
        ProtocolVersion::Resp2 => b"*-1\r\n",
        ProtocolVersion::Resp3 => b"_\r\n",
    }
}

/// Boolean reply: `#t`/`#f` in version 3, integers 1/0 in version 2.
#[must_use]
pub fn boolean(version: ProtocolVersion, value: bool) -> &'static [u8] {
    match (version, value) {
        (ProtocolVersion::Resp3, true) => b"#t\r\n",
        (ProtocolVersion::Resp3, false) => b"#f\r\n",
        (ProtocolVersion::Resp2, true) => b":1\r\n",
        (ProtocolVersion::Resp2, false) => b":0\r\n",
    }
}

/// Double reply: `,<value>\r\n` in version 3, a bulk string of the same text in version 2.
/// IEEE infinities are the literal `inf`/`-inf` tokens; NaN is the literal `nan`.
#[must_use]
pub fn double(version: ProtocolVersion, value: f64) -> Vec<u8> {
    let text = if value.is_nan() {
        "nan".to_owned()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else {
        format!("{value}")
    };
    match version {
        ProtocolVersion::Resp2 => bulk(text.as_bytes()),
        ProtocolVersion::Resp3 => {
            let mut bytes = Vec::with_capacity(text.len() + 3);
            bytes.push(b',');
            bytes.extend_from_slice(text.as_bytes());
            bytes.extend_from_slice(b"\r\n");
            bytes
        }
    }
}

/// Verbatim string: `=<len>\r\n<ext>:<payload>\r\n` in version 3, a plain bulk in version 2.
///
/// Only the first three bytes of `ext` are used; shorter extensions are space-padded.
#[must_use]
pub fn verbatim(version: ProtocolVersion, ext: &str, payload: &[u8]) -> Vec<u8> {
    match version {
        ProtocolVersion::Resp2 => bulk(payload),
        ProtocolVersion::Resp3 => {
            let mut tag = [b' '; 3];
            for (slot, byte) in tag.iter_mut().zip(ext.bytes()) {
                *slot = byte;
            }
            let mut bytes = Vec::with_capacity(payload.len() + 16);
            bytes.push(b'=');
            bytes.extend_from_slice((payload.len() + 4).to_string().as_bytes());
            bytes.extend_from_slice(b"\r\n");
            bytes.extend_from_slice(&tag);
            bytes.push(b':');
            bytes.extend_from_slice(payload);
            bytes.extend_from_slice(b"\r\n");
            bytes
        }
    }
}
