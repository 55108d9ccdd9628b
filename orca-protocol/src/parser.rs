//! Incremental request parser for the inline and multibulk encodings.
//!
//! A connection parser keeps unread bytes in a growable buffer and repeatedly tries to extract
//! complete commands as new network chunks arrive. Incomplete input is never an error: the
//! parser preserves its state and resumes when more bytes are fed. Malformed or oversized input
//! is fatal for the connection; the caller emits the error reply and stops parsing.

use orca_common::config::RuntimeConfig;
use orca_common::error::{OrcaError, OrcaResult};

/// Arguments at or above this size take the adoption fast path: when such an argument exactly
/// fills the remaining buffer it is handed over as the argument's storage instead of copied.
pub const BIG_ARG_BYTES: usize = 32 * 1024;

/// Protocol size limits enforced while parsing one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Maximum inline request line, also bounds unterminated header lines.
    pub inline_max_bytes: usize,
    /// Maximum single bulk argument payload.
    pub bulk_max_bytes: usize,
    /// Maximum element count of one multibulk request.
    pub multibulk_max_elements: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

impl ParserLimits {
    /// Derives parser limits from process configuration.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            inline_max_bytes: config.proto_inline_max_bytes,
            bulk_max_bytes: config.proto_max_bulk_bytes,
            multibulk_max_elements: config.proto_max_multibulk_elements,
        }
    }
}

/// One fully-parsed request: an owned argument vector, possibly empty.
///
/// An empty vector comes from a bare newline in the inline encoding or a `*0` multibulk
/// header; the caller decides whether that is a no-op or a liveness refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    /// Raw argument payloads in wire order; the first entry is the command name.
    pub args: Vec<Vec<u8>>,
}

impl ParsedRequest {
    /// Command name in canonical uppercase form, when present.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.args
            .first()
            .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
    }
}

/// Outcome of one parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are required; parser state is preserved.
    Incomplete,
    /// One complete request was extracted from the buffer.
    Ready(ParsedRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Inline,
    Multibulk,
}

/// Streaming parser state for one connection.
#[derive(Debug)]
pub struct RequestParser {
    limits: ParserLimits,
    buffer: Vec<u8>,
    /// Consumed-but-not-yet-trimmed prefix of `buffer`.
    pos: usize,
    kind: Option<RequestKind>,
    multibulk_remaining: usize,
    bulk_len: Option<usize>,
    args: Vec<Vec<u8>>,
}

impl RequestParser {
    /// Creates an empty parser with the given limits.
    #[must_use]
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            limits,
            buffer: Vec::new(),
            pos: 0,
            kind: None,
            multibulk_remaining: 0,
            bulk_len: None,
            args: Vec::new(),
        }
    }

    /// Appends newly received network bytes to the input buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the number of buffered bytes not yet consumed by parsing.
    #[must_use]
    pub fn unconsumed_bytes(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Returns the total size of the input buffer, consumed prefix included.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the allocated-but-unused tail of the input buffer.
    #[must_use]
    pub fn spare_capacity(&self) -> usize {
        self.buffer.capacity() - self.buffer.len()
    }

    /// Buffered bytes not yet consumed, for protocol-error diagnostics.
    #[must_use]
    pub fn unconsumed_slice(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }

    /// When mid-way through a large bulk argument, returns how many more bytes complete it.
    ///
    /// The read path uses this to shrink its next read so the argument lands exactly at the
    /// buffer boundary and qualifies for the adoption fast path.
    #[must_use]
    pub fn pending_big_bulk_remaining(&self) -> Option<usize> {
        let bulk_len = self.bulk_len?;
        if bulk_len < BIG_ARG_BYTES {
            return None;
        }
        (bulk_len + 2).checked_sub(self.buffer.len())
    }

    /// Tries to extract the next complete request from buffered bytes.
    ///
    /// # Errors
    ///
    /// Returns `OrcaError::Protocol` on malformed or oversized input. Protocol errors are fatal
    /// for the connection: the caller must stop feeding this parser.
    pub fn try_next(&mut self) -> OrcaResult<ParseStatus> {
        let status = self.parse_pending();
        if self.pos > 0 {
            let _ = self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        status
    }

    fn parse_pending(&mut self) -> OrcaResult<ParseStatus> {
        if self.pos >= self.buffer.len() {
            return Ok(ParseStatus::Incomplete);
        }
        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                let kind = if self.buffer[self.pos] == b'*' {
                    RequestKind::Multibulk
                } else {
                    RequestKind::Inline
                };
                self.kind = Some(kind);
                kind
            }
        };
        match kind {
            RequestKind::Inline => self.parse_inline(),
            RequestKind::Multibulk => self.parse_multibulk(),
        }
    }

    fn parse_inline(&mut self) -> OrcaResult<ParseStatus> {
        let unconsumed = &self.buffer[self.pos..];
        let Some(newline) = unconsumed.iter().position(|byte| *byte == b'\n') else {
            if unconsumed.len() > self.limits.inline_max_bytes {
                return Err(OrcaError::Protocol("too big inline request".to_owned()));
            }
            return Ok(ParseStatus::Incomplete);
        };

        let mut line_end = newline;
        let mut terminator = 1;
        if line_end > 0 && unconsumed[line_end - 1] == b'\r' {
            line_end -= 1;
            terminator = 2;
        }

        let Some(args) = split_inline_args(&unconsumed[..line_end]) else {
            return Err(OrcaError::Protocol(
                "unbalanced quotes in request".to_owned(),
            ));
        };

        self.pos += line_end + terminator;
        self.kind = None;
        Ok(ParseStatus::Ready(ParsedRequest { args }))
    }

    fn parse_multibulk(&mut self) -> OrcaResult<ParseStatus> {
        if self.multibulk_remaining == 0 {
            debug_assert!(self.args.is_empty(), "argument vector must start empty");
            let unconsumed = &self.buffer[self.pos..];
            let Some(line_end) = unconsumed.iter().position(|byte| *byte == b'\r') else {
                if unconsumed.len() > self.limits.inline_max_bytes {
                    return Err(OrcaError::Protocol("too big mbulk count string".to_owned()));
                }
                return Ok(ParseStatus::Incomplete);
            };
            if line_end + 1 >= unconsumed.len() {
                // The terminating \n has not arrived yet.
                return Ok(ParseStatus::Incomplete);
            }

            debug_assert_eq!(unconsumed[0], b'*');
            let count = parse_decimal(&unconsumed[1..line_end]);
            let element_limit = i64::try_from(self.limits.multibulk_max_elements).unwrap_or(i64::MAX);
            let Some(count) = count.filter(|count| *count >= 0 && *count <= element_limit) else {
                return Err(OrcaError::Protocol("invalid multibulk length".to_owned()));
            };

            self.pos += line_end + 2;
            if count == 0 {
                self.kind = None;
                return Ok(ParseStatus::Ready(ParsedRequest { args: Vec::new() }));
            }
            self.multibulk_remaining = count as usize;
            self.args = Vec::with_capacity(self.multibulk_remaining.min(1024));
        }

        while self.multibulk_remaining > 0 {
            if self.bulk_len.is_none() && !self.parse_bulk_header()? {
                break;
            }
            let Some(bulk_len) = self.bulk_len else { break };

            if self.buffer.len() - self.pos < bulk_len + 2 {
                // Not enough data (+2 is the trailing CRLF).
                break;
            }

            if self.pos == 0 && bulk_len >= BIG_ARG_BYTES && self.buffer.len() == bulk_len + 2 {
                // The buffer contains exactly this argument: adopt its storage instead of
                // copying, and start a fresh buffer sized for a likely sibling argument.
                let mut adopted =
                    std::mem::replace(&mut self.buffer, Vec::with_capacity(bulk_len + 2));
                adopted.truncate(bulk_len);
                self.args.push(adopted);
            } else {
                self.args
                    .push(self.buffer[self.pos..self.pos + bulk_len].to_vec());
                self.pos += bulk_len + 2;
            }
            self.bulk_len = None;
            self.multibulk_remaining -= 1;
        }

        if self.multibulk_remaining == 0 {
            self.kind = None;
            return Ok(ParseStatus::Ready(ParsedRequest {
                args: std::mem::take(&mut self.args),
            }));
        }
        Ok(ParseStatus::Incomplete)
    }

    /// Parses one `$<len>\r\n` header; returns `Ok(false)` when it is not fully buffered.
    fn parse_bulk_header(&mut self) -> OrcaResult<bool> {
        let unconsumed = &self.buffer[self.pos..];
        let Some(line_end) = unconsumed.iter().position(|byte| *byte == b'\r') else {
            if unconsumed.len() > self.limits.inline_max_bytes {
                return Err(OrcaError::Protocol("too big bulk count string".to_owned()));
            }
            return Ok(false);
        };
        if line_end + 1 >= unconsumed.len() {
            return Ok(false);
        }
        if unconsumed[0] != b'$' {
            return Err(OrcaError::Protocol(format!(
                "expected '$', got '{}'",
                char::from(unconsumed[0])
            )));
        }

        let bulk_limit = i64::try_from(self.limits.bulk_max_bytes).unwrap_or(i64::MAX);
        let length = parse_decimal(&unconsumed[1..line_end])
            .filter(|length| *length >= 0 && *length <= bulk_limit);
        let Some(length) = length else {
            return Err(OrcaError::Protocol("invalid bulk length".to_owned()));
        };
        let length = length as usize;

        self.pos += line_end + 2;
        if length >= BIG_ARG_BYTES && self.buffer.len() - self.pos <= length + 2 {
            // Large payload incoming: move the unread tail to the front now so the argument
            // can start at the buffer boundary and be adopted without a copy.
            let _ = self.buffer.drain(..self.pos);
            self.pos = 0;
            self.buffer.reserve(length + 2 - self.buffer.len());
        }
        self.bulk_len = Some(length);
        Ok(true)
    }
}

/// Strict decimal parser: optional leading `-`, digits only, overflow-checked.
fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return None;
    }
    let (negative, digits) = match bytes[0] {
        b'-' => (true, &bytes[1..]),
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return None;
    }
    let mut value = 0_i64;
    for byte in digits {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_add(i64::from(byte - b'0'))?;
    }
    Some(if negative { -value } else { value })
}

/// Splits an inline request line into whitespace/quote-delimited tokens.
///
/// Double quotes support `\xHH` hex escapes and the usual character escapes; single quotes are
/// literal apart from `\'`. A closing quote must be followed by whitespace or end of line.
/// Returns `None` on unbalanced quoting. Empty tokens (e.g. `""`) are dropped.
fn split_inline_args(line: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut args: Vec<Vec<u8>> = Vec::new();
    let mut i = 0_usize;
    loop {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= line.len() {
            return Some(args);
        }

        let mut current = Vec::new();
        let mut in_quotes = false;
        let mut in_single_quotes = false;
        let mut done = false;
        while !done {
            let byte = line.get(i).copied();
            if in_quotes {
                match byte {
                    None => return None,
                    Some(b'\\')
                        if i + 3 < line.len()
                            && line[i + 1] == b'x'
                            && line[i + 2].is_ascii_hexdigit()
                            && line[i + 3].is_ascii_hexdigit() =>
                    {
                        current.push(hex_pair_value(line[i + 2], line[i + 3]));
                        i += 3;
                    }
                    Some(b'\\') if i + 1 < line.len() => {
                        i += 1;
                        current.push(unescape_char(line[i]));
                    }
                    Some(b'"') => {
                        if line.get(i + 1).is_some_and(|next| !next.is_ascii_whitespace()) {
                            return None;
                        }
                        done = true;
                    }
                    Some(other) => current.push(other),
                }
            } else if in_single_quotes {
                match byte {
                    None => return None,
                    Some(b'\\') if line.get(i + 1) == Some(&b'\'') => {
                        i += 1;
                        current.push(b'\'');
                    }
                    Some(b'\'') => {
                        if line.get(i + 1).is_some_and(|next| !next.is_ascii_whitespace()) {
                            return None;
                        }
                        done = true;
                    }
                    Some(other) => current.push(other),
                }
            } else {
                match byte {
                    None | Some(b' ' | b'\n' | b'\r' | b'\t') => done = true,
                    Some(b'"') => in_quotes = true,
                    Some(b'\'') => in_single_quotes = true,
                    Some(other) => current.push(other),
                }
            }
            if i < line.len() {
                i += 1;
            }
        }
        if !current.is_empty() {
            args.push(current);
        }
    }
}

fn hex_digit_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => 0,
    }
}

fn hex_pair_value(high: u8, low: u8) -> u8 {
    (hex_digit_value(high) << 4) | hex_digit_value(low)
}

fn unescape_char(escaped: u8) -> u8 {
    match escaped {
        b'n' => b'\n',
        b'r' => b'\r',
        b't' => b'\t',
        b'b' => 0x08,
        b'a' => 0x07,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::{BIG_ARG_BYTES, ParseStatus, ParserLimits, RequestParser};
    use googletest::prelude::*;
    use orca_common::error::OrcaError;
    use rstest::rstest;

    fn parser() -> RequestParser {
        RequestParser::new(ParserLimits::default())
    }

    fn ready_args(status: ParseStatus) -> Vec<Vec<u8>> {
        match status {
            ParseStatus::Ready(request) => request.args,
            ParseStatus::Incomplete => panic!("expected a complete request"),
        }
    }

    #[rstest]
    fn multibulk_fed_one_byte_at_a_time_yields_exactly_one_command() {
        let payload = b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        let mut parser = parser();
        for (index, byte) in payload.iter().enumerate() {
            parser.feed(std::slice::from_ref(byte));
            let status = parser
                .try_next()
                .expect("partial multibulk input must never error");
            if index + 1 < payload.len() {
                assert_that!(&status, eq(&ParseStatus::Incomplete));
            } else {
                let args = ready_args(status);
                assert_that!(&args, eq(&vec![b"foo".to_vec(), b"bar".to_vec()]));
            }
        }
        assert_that!(parser.unconsumed_bytes(), eq(0_usize));
    }

    #[rstest]
    fn pipelined_commands_are_extracted_in_order() {
        let mut parser = parser();
        parser.feed(b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n");

        let first = ready_args(parser.try_next().expect("first command must parse"));
        assert_that!(&first, eq(&vec![b"PING".to_vec()]));

        let second = ready_args(parser.try_next().expect("second command must parse"));
        assert_that!(&second, eq(&vec![b"ECHO".to_vec(), b"hello".to_vec()]));
        assert_that!(parser.unconsumed_bytes(), eq(0_usize));
    }

    #[rstest]
    fn oversized_bulk_length_fails_before_any_allocation() {
        let mut parser = parser();
        parser.feed(b"*1\r\n$5000000000\r\n");
        let error = parser
            .try_next()
            .expect_err("bulk length above the limit must be a protocol error");
        assert_that!(
            error,
            eq(&OrcaError::Protocol("invalid bulk length".to_owned()))
        );
    }

    #[rstest]
    fn negative_multibulk_count_is_a_protocol_error() {
        let mut parser = parser();
        parser.feed(b"*-1\r\n");
        let error = parser
            .try_next()
            .expect_err("negative element count must be rejected");
        assert_that!(
            error,
            eq(&OrcaError::Protocol("invalid multibulk length".to_owned()))
        );
    }

    #[rstest]
    fn zero_multibulk_count_yields_an_empty_request() {
        let mut parser = parser();
        parser.feed(b"*0\r\n");
        let args = ready_args(parser.try_next().expect("empty multibulk must parse"));
        assert_that!(args.is_empty(), eq(true));
        assert_that!(parser.unconsumed_bytes(), eq(0_usize));
    }

    #[rstest]
    fn non_dollar_argument_header_is_a_protocol_error() {
        let mut parser = parser();
        parser.feed(b"*1\r\n#3\r\nfoo\r\n");
        let error = parser
            .try_next()
            .expect_err("argument header must start with '$'");
        assert_that!(
            error,
            eq(&OrcaError::Protocol("expected '$', got '#'".to_owned()))
        );
    }

    #[rstest]
    fn inline_request_splits_quoted_tokens() {
        let mut parser = parser();
        parser.feed(b"SET \"key with space\" 'single \\' quote'\r\n");
        let args = ready_args(parser.try_next().expect("quoted inline line must parse"));
        assert_that!(
            &args,
            eq(&vec![
                b"SET".to_vec(),
                b"key with space".to_vec(),
                b"single ' quote".to_vec(),
            ])
        );
    }

    #[rstest]
    fn inline_hex_escapes_decode_inside_double_quotes() {
        let mut parser = parser();
        parser.feed(b"ECHO \"\\x41\\x42\"\n");
        let args = ready_args(parser.try_next().expect("hex escapes must parse"));
        assert_that!(&args, eq(&vec![b"ECHO".to_vec(), b"AB".to_vec()]));
    }

    #[rstest]
    fn unbalanced_quotes_are_a_protocol_error() {
        let mut parser = parser();
        parser.feed(b"GET \"unterminated\r\n");
        let error = parser
            .try_next()
            .expect_err("unbalanced quoting must be rejected");
        assert_that!(
            error,
            eq(&OrcaError::Protocol("unbalanced quotes in request".to_owned()))
        );
    }

    #[rstest]
    fn empty_inline_line_yields_an_empty_request() {
        let mut parser = parser();
        parser.feed(b"\r\n");
        let args = ready_args(parser.try_next().expect("bare newline must parse"));
        assert_that!(args.is_empty(), eq(true));
    }

    #[rstest]
    fn unterminated_inline_line_over_the_limit_is_fatal() {
        let limits = ParserLimits {
            inline_max_bytes: 16,
            ..ParserLimits::default()
        };
        let mut parser = RequestParser::new(limits);
        parser.feed(b"GET averylongkeywithnoterminator");
        let error = parser
            .try_next()
            .expect_err("oversized unterminated line must be rejected");
        assert_that!(
            error,
            eq(&OrcaError::Protocol("too big inline request".to_owned()))
        );
    }

    #[rstest]
    fn big_argument_exactly_filling_the_buffer_is_adopted() {
        let payload_len = BIG_ARG_BYTES;
        let mut parser = parser();
        parser.feed(format!("*2\r\n$3\r\nSET\r\n${payload_len}\r\n").as_bytes());
        assert_that!(
            &parser.try_next().expect("header-only prefix must not error"),
            eq(&ParseStatus::Incomplete)
        );
        assert_that!(
            parser.pending_big_bulk_remaining(),
            eq(Some(payload_len + 2))
        );

        let mut payload = vec![b'v'; payload_len];
        payload.extend_from_slice(b"\r\n");
        parser.feed(&payload);
        let args = ready_args(parser.try_next().expect("adopted argument must parse"));
        assert_that!(args.len(), eq(2_usize));
        assert_that!(args[1].len(), eq(payload_len));
        assert_that!(args[1].iter().all(|byte| *byte == b'v'), eq(true));
        assert_that!(parser.unconsumed_bytes(), eq(0_usize));
    }

    #[rstest]
    fn parser_state_survives_split_bulk_headers() {
        let mut parser = parser();
        parser.feed(b"*2\r\n$3\r\nfoo\r\n$3");
        assert_that!(
            &parser.try_next().expect("split header must not error"),
            eq(&ParseStatus::Incomplete)
        );
        parser.feed(b"\r\nbar\r\n");
        let args = ready_args(parser.try_next().expect("completed request must parse"));
        assert_that!(&args, eq(&vec![b"foo".to_vec(), b"bar".to_vec()]));
    }
}
