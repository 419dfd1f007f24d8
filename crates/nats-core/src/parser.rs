//! Incremental protocol parser
//!
//! The server speaks a line-oriented protocol:
//! ```text
//! INFO {"server_id":"...",...}\r\n
//! MSG <subject> <sid> [reply-to] <#bytes>\r\n<payload>\r\n
//! HMSG <subject> <sid> [reply-to] <#header bytes> <#total bytes>\r\n<headers><payload>\r\n
//! PING\r\n
//! PONG\r\n
//! +OK\r\n
//! -ERR <error message>\r\n
//! ```
//!
//! [`Parser::feed`] accepts chunks of any size, including empty and single
//! byte chunks, and yields the same events whatever the chunk boundaries.
//! All state needed to resume in the middle of a keyword, an argument line
//! or a payload is kept in the parser between calls.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;

use crate::{Buffer, Error, Result, Statistics, MAX_CONTROL_LINE_SIZE};

/// Payloads up to this size are assembled in the reusable scratch buffer
pub const SCRATCH_SIZE: usize = 512;

/// Event produced by the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    /// Raw greeting payload (the bytes between `INFO ` and the line end)
    Info(Bytes),
    /// A message for one of our subscriptions
    Msg(MsgEvent),
    Ping,
    Pong,
    Ok,
    /// Server error text, without surrounding quotes
    Err(String),
}

/// A fully assembled `MSG` or `HMSG`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgEvent {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    /// Raw header block, present for `HMSG` only
    pub headers: Option<Bytes>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Msg,
    Hmsg,
    Info,
    Ping,
    Pong,
    Ok,
    Err,
}

impl Op {
    fn keyword(self) -> &'static [u8] {
        match self {
            Op::Msg => b"MSG",
            Op::Hmsg => b"HMSG",
            Op::Info => b"INFO",
            Op::Ping => b"PING",
            Op::Pong => b"PONG",
            Op::Ok => b"+OK",
            Op::Err => b"-ERR",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Op::Msg => "MSG",
            Op::Hmsg => "HMSG",
            Op::Info => "INFO",
            Op::Ping => "PING",
            Op::Pong => "PONG",
            Op::Ok => "+OK",
            Op::Err => "-ERR",
        }
    }

    fn takes_args(self) -> bool {
        matches!(self, Op::Msg | Op::Hmsg | Op::Info | Op::Err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OpStart,
    /// `P` seen, `PING` or `PONG` follows
    OpP,
    Keyword { op: Op, matched: usize },
    /// Keyword complete, at least one space or tab required
    ArgStart { op: Op, seen_space: bool },
    Arg(Op),
    /// Argument-less operation, anything up to `\n` is ignored
    LineEnd(Op),
    Payload,
    /// Payload complete, skipping its trailing CRLF
    MsgEnd,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::OpStart => "OP_START",
            State::OpP => "OP_P",
            State::Keyword { .. } => "OP_KEYWORD",
            State::ArgStart { .. } => "OP_ARG_START",
            State::Arg(_) => "OP_ARG",
            State::LineEnd(_) => "OP_LINE_END",
            State::Payload => "MSG_PAYLOAD",
            State::MsgEnd => "MSG_END",
        }
    }
}

/// Arguments of the `MSG`/`HMSG` line currently being assembled
#[derive(Debug, Clone, PartialEq, Eq)]
struct MsgArgs {
    subject: String,
    sid: u64,
    reply: Option<String>,
    header_len: Option<usize>,
    total_len: usize,
}

/// Where the bytes of a split payload are accumulated
#[derive(Debug)]
enum Pending {
    None,
    Scratch,
    Heap(BytesMut),
}

/// Resumable protocol parser, one per connection
#[derive(Debug)]
pub struct Parser {
    state: State,
    arg_buf: Buffer<'static>,
    scratch: Buffer<'static>,
    pending: Pending,
    args: Option<MsgArgs>,
    stats: Arc<Statistics>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self::with_stats(Arc::new(Statistics::default()))
    }

    /// Create a parser that counts inbound messages into `stats`
    pub fn with_stats(stats: Arc<Statistics>) -> Self {
        Self {
            state: State::OpStart,
            arg_buf: Buffer::with_capacity(128),
            scratch: Buffer::with_capacity(SCRATCH_SIZE),
            pending: Pending::None,
            args: None,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// Whether the parser sits between two frames
    pub fn is_idle(&self) -> bool {
        self.state == State::OpStart
    }

    /// Drop any partially parsed frame
    pub fn reset(&mut self) {
        self.state = State::OpStart;
        self.arg_buf.reset();
        self.scratch.reset();
        self.pending = Pending::None;
        self.args = None;
    }

    /// Feed a chunk and collect the events it completes
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ParsedEvent>> {
        let mut events = Vec::new();
        self.feed_into(data, &mut events)?;
        Ok(events)
    }

    /// Feed a chunk, pushing completed events into `events`
    ///
    /// On error, events completed before the offending byte stay in
    /// `events` and the in-progress frame is discarded.
    pub fn feed_into(&mut self, data: &[u8], events: &mut Vec<ParsedEvent>) -> Result<()> {
        let result = self.run(data, events);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn run(&mut self, data: &[u8], events: &mut Vec<ParsedEvent>) -> Result<()> {
        let mut i = 0;
        while i < data.len() {
            let b = data[i];
            match self.state {
                State::OpStart => {
                    self.state = match b {
                        b'M' => State::Keyword { op: Op::Msg, matched: 1 },
                        b'H' => State::Keyword { op: Op::Hmsg, matched: 1 },
                        b'I' => State::Keyword { op: Op::Info, matched: 1 },
                        b'P' => State::OpP,
                        b'+' => State::Keyword { op: Op::Ok, matched: 1 },
                        b'-' => State::Keyword { op: Op::Err, matched: 1 },
                        _ => return Err(self.unexpected(b)),
                    };
                }
                State::OpP => {
                    self.state = match b {
                        b'I' => State::Keyword { op: Op::Ping, matched: 2 },
                        b'O' => State::Keyword { op: Op::Pong, matched: 2 },
                        _ => return Err(self.unexpected(b)),
                    };
                }
                State::Keyword { op, matched } => {
                    let keyword = op.keyword();
                    if b != keyword[matched] {
                        return Err(self.unexpected(b));
                    }
                    self.state = if matched + 1 < keyword.len() {
                        State::Keyword { op, matched: matched + 1 }
                    } else if op.takes_args() {
                        State::ArgStart { op, seen_space: false }
                    } else {
                        State::LineEnd(op)
                    };
                }
                State::ArgStart { op, seen_space } => match b {
                    b' ' | b'\t' => self.state = State::ArgStart { op, seen_space: true },
                    _ if !seen_space => return Err(self.unexpected(b)),
                    _ => {
                        self.arg_buf.reset();
                        self.state = State::Arg(op);
                        // Reprocess this byte as the first argument byte.
                        continue;
                    }
                },
                State::Arg(op) => {
                    let rest = &data[i..];
                    match rest.iter().position(|&c| c == b'\n') {
                        Some(nl) => {
                            self.push_arg(&rest[..nl])?;
                            i += nl + 1;
                            self.finish_arg_line(op, events)?;
                        }
                        None => {
                            self.push_arg(rest)?;
                            i = data.len();
                        }
                    }
                    continue;
                }
                State::LineEnd(op) => {
                    if b == b'\n' {
                        events.push(match op {
                            Op::Ping => ParsedEvent::Ping,
                            Op::Pong => ParsedEvent::Pong,
                            _ => ParsedEvent::Ok,
                        });
                        self.state = State::OpStart;
                    }
                }
                State::Payload => {
                    let total = self.args.as_ref().map(|a| a.total_len).unwrap_or(0);
                    let have = self.pending_len();
                    let take = (total - have).min(data.len() - i);
                    let chunk = &data[i..i + take];
                    i += take;

                    if have == 0 && take == total {
                        // Whole payload in this chunk: no intermediate copy.
                        let payload = Bytes::copy_from_slice(chunk);
                        self.complete_msg(payload, events);
                    } else {
                        self.accumulate(chunk, total);
                        if self.pending_len() == total {
                            let payload = self.take_pending();
                            self.complete_msg(payload, events);
                        }
                    }
                    continue;
                }
                State::MsgEnd => {
                    if b == b'\n' {
                        self.state = State::OpStart;
                    }
                }
            }
            i += 1;
        }
        Ok(())
    }

    fn unexpected(&self, byte: u8) -> Error {
        Error::UnexpectedByte {
            byte,
            state: self.state.name(),
        }
    }

    fn push_arg(&mut self, bytes: &[u8]) -> Result<()> {
        let len = self.arg_buf.len() + bytes.len();
        if len > MAX_CONTROL_LINE_SIZE {
            return Err(Error::ControlLineTooLong(len));
        }
        self.arg_buf.append(bytes);
        Ok(())
    }

    fn finish_arg_line(&mut self, op: Op, events: &mut Vec<ParsedEvent>) -> Result<()> {
        let mut line = self.arg_buf.data();
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }

        match op {
            Op::Msg | Op::Hmsg => {
                let args = parse_msg_args(op, line)?;
                let total = args.total_len;
                self.arg_buf.reset();
                self.args = Some(args);
                self.pending = Pending::None;
                self.state = State::Payload;
                if total == 0 {
                    self.complete_msg(Bytes::new(), events);
                }
            }
            Op::Info => {
                events.push(ParsedEvent::Info(Bytes::copy_from_slice(line)));
                self.arg_buf.reset();
                self.state = State::OpStart;
            }
            _ => {
                let text = {
                    let raw = String::from_utf8_lossy(line);
                    raw.trim().trim_matches('\'').to_string()
                };
                events.push(ParsedEvent::Err(text));
                self.arg_buf.reset();
                self.state = State::OpStart;
            }
        }
        Ok(())
    }

    fn pending_len(&self) -> usize {
        match &self.pending {
            Pending::None => 0,
            Pending::Scratch => self.scratch.len(),
            Pending::Heap(buf) => buf.len(),
        }
    }

    fn accumulate(&mut self, chunk: &[u8], total: usize) {
        if matches!(self.pending, Pending::None) {
            self.pending = if total <= SCRATCH_SIZE {
                self.scratch.reset();
                Pending::Scratch
            } else {
                Pending::Heap(BytesMut::with_capacity(total))
            };
        }
        match &mut self.pending {
            Pending::Scratch => self.scratch.append(chunk),
            Pending::Heap(buf) => buf.extend_from_slice(chunk),
            Pending::None => {}
        }
    }

    fn take_pending(&mut self) -> Bytes {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None => Bytes::new(),
            Pending::Scratch => {
                let payload = Bytes::copy_from_slice(self.scratch.data());
                self.scratch.reset();
                payload
            }
            Pending::Heap(buf) => buf.freeze(),
        }
    }

    fn complete_msg(&mut self, payload: Bytes, events: &mut Vec<ParsedEvent>) {
        self.state = State::MsgEnd;
        let Some(args) = self.args.take() else {
            return;
        };

        self.stats.record_in(args.total_len as u64);

        let (headers, payload) = match args.header_len {
            Some(hdr_len) => (Some(payload.slice(..hdr_len)), payload.slice(hdr_len..)),
            None => (None, payload),
        };
        events.push(ParsedEvent::Msg(MsgEvent {
            subject: args.subject,
            sid: args.sid,
            reply: args.reply,
            headers,
            payload,
        }));
    }
}

fn parse_msg_args(op: Op, line: &[u8]) -> Result<MsgArgs> {
    let tokens: Vec<&[u8]> = line
        .split(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .filter(|t| !t.is_empty())
        .collect();

    let line_str = || String::from_utf8_lossy(line).into_owned();
    let text = |t: &[u8]| String::from_utf8_lossy(t).into_owned();

    let (reply, sid_idx, hdr_idx, size_idx) = match (op, tokens.len()) {
        (Op::Msg, 3) => (None, 1, None, 2),
        (Op::Msg, 4) => (Some(tokens[2]), 1, None, 3),
        (Op::Hmsg, 4) => (None, 1, Some(2), 3),
        (Op::Hmsg, 5) => (Some(tokens[2]), 1, Some(3), 4),
        _ => {
            return Err(Error::WrongArgCount {
                op: op.name(),
                line: line_str(),
            })
        }
    };

    let sid = parse_decimal(tokens[sid_idx]).ok_or_else(|| Error::BadSidOrSize(line_str()))?;
    let total_len = parse_decimal(tokens[size_idx])
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| Error::BadSidOrSize(line_str()))?;

    let header_len = match hdr_idx {
        Some(idx) => {
            let hdr = parse_decimal(tokens[idx])
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| Error::BadHeaderSize(line_str()))?;
            if hdr > total_len {
                return Err(Error::BadHeaderSize(line_str()));
            }
            Some(hdr)
        }
        None => None,
    };

    Ok(MsgArgs {
        subject: text(tokens[0]),
        sid,
        reply: reply.map(text),
        header_len,
        total_len,
    })
}

/// Parse an unsigned decimal, rejecting empty input, non-digits and overflow
pub fn parse_decimal(token: &[u8]) -> Option<u64> {
    if token.is_empty() {
        return None;
    }
    token.iter().try_fold(0u64, |acc, &b| {
        if !b.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(u64::from(b - b'0'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal(b"0"), Some(0));
        assert_eq!(parse_decimal(b"12345"), Some(12345));
        assert_eq!(parse_decimal(b""), None);
        assert_eq!(parse_decimal(b"-1"), None);
        assert_eq!(parse_decimal(b"12a"), None);
        assert_eq!(parse_decimal(b"18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_decimal(b"18446744073709551616"), None);
    }

    #[test]
    fn test_state_survives_keyword_split() {
        let mut parser = Parser::new();
        assert!(parser.feed(b"PI").unwrap().is_empty());
        assert!(!parser.is_idle());
        assert_eq!(parser.feed(b"NG\r\n").unwrap(), vec![ParsedEvent::Ping]);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_large_payload_uses_heap() {
        let mut parser = Parser::new();
        let payload = vec![b'x'; SCRATCH_SIZE * 3];
        let mut frame = format!("MSG big 7 {}\r\n", payload.len()).into_bytes();
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(b"\r\n");

        let mut events = Vec::new();
        for chunk in frame.chunks(100) {
            parser.feed_into(chunk, &mut events).unwrap();
            if !events.is_empty() {
                break;
            }
            if parser.state == State::Payload && parser.pending_len() > 0 {
                assert!(matches!(parser.pending, Pending::Heap(_)));
            }
        }
        match &events[0] {
            ParsedEvent::Msg(msg) => assert_eq!(msg.payload.len(), payload.len()),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
