//! Parser tests for nats-core
//!
//! Covers:
//! - Every operation the server sends
//! - Resumption across arbitrary chunk boundaries
//! - Argument count, sid/size and header size errors
//! - Inbound message counters

use nats_core::{Error, MsgEvent, ParsedEvent, Parser};

/// A stream touching every operation, including a split-prone HMSG
const STREAM: &[u8] = b"INFO {\"server_id\":\"S1\",\"max_payload\":1048576}\r\n\
PING\r\n\
MSG foo 1 5\r\nhello\r\n\
MSG foo.bar 22 _INBOX.abc 3\r\nxyz\r\n\
+OK\r\n\
HMSG hdr 3 12 14\r\nNATS/1.0\r\n\r\nhi\r\n\
MSG empty 4 0\r\n\r\n\
PONG\r\n\
-ERR 'Permissions Violation for Publish to foo'\r\n";

fn feed_chunks(chunks: &[&[u8]]) -> Vec<ParsedEvent> {
    let mut parser = Parser::new();
    let mut events = Vec::new();
    for chunk in chunks {
        parser
            .feed_into(chunk, &mut events)
            .expect("parse failed");
    }
    events
}

fn msg(event: &ParsedEvent) -> &MsgEvent {
    match event {
        ParsedEvent::Msg(m) => m,
        other => panic!("Expected MSG, got {:?}", other),
    }
}

// ============================================================================
// Operations
// ============================================================================

#[test]
fn test_parse_full_stream() {
    let events = feed_chunks(&[STREAM]);
    assert_eq!(events.len(), 9);

    assert!(matches!(&events[0], ParsedEvent::Info(raw) if raw.starts_with(b"{\"server_id\"")));
    assert_eq!(events[1], ParsedEvent::Ping);

    let first = msg(&events[2]);
    assert_eq!(first.subject, "foo");
    assert_eq!(first.sid, 1);
    assert_eq!(first.reply, None);
    assert_eq!(&first.payload[..], b"hello");

    let second = msg(&events[3]);
    assert_eq!(second.sid, 22);
    assert_eq!(second.reply.as_deref(), Some("_INBOX.abc"));

    assert_eq!(events[4], ParsedEvent::Ok);

    let with_headers = msg(&events[5]);
    assert_eq!(with_headers.headers.as_deref(), Some(&b"NATS/1.0\r\n\r\n"[..]));
    assert_eq!(&with_headers.payload[..], b"hi");

    assert!(msg(&events[6]).payload.is_empty());
    assert_eq!(events[7], ParsedEvent::Pong);
    assert_eq!(
        events[8],
        ParsedEvent::Err("Permissions Violation for Publish to foo".to_string())
    );
}

#[test]
fn test_tabs_and_repeated_spaces_between_args() {
    let events = feed_chunks(&[b"MSG \t foo\t\t9   2\r\nok\r\n"]);
    let m = msg(&events[0]);
    assert_eq!(m.subject, "foo");
    assert_eq!(m.sid, 9);
    assert_eq!(&m.payload[..], b"ok");
}

#[test]
fn test_ping_tolerates_trailing_content() {
    let events = feed_chunks(&[b"PING extra\r\nPONG\r\n"]);
    assert_eq!(events, vec![ParsedEvent::Ping, ParsedEvent::Pong]);
}

#[test]
fn test_keywords_are_case_sensitive() {
    let mut parser = Parser::new();
    let err = parser.feed(b"ping\r\n").unwrap_err();
    assert!(matches!(err, Error::UnexpectedByte { byte: b'p', .. }));
}

#[test]
fn test_payload_may_contain_crlf() {
    let events = feed_chunks(&[b"MSG foo 1 4\r\n\r\n\r\n\r\n"]);
    assert_eq!(&msg(&events[0]).payload[..], b"\r\n\r\n");
}

// ============================================================================
// Fragmentation
// ============================================================================

#[test]
fn test_split_after_byte_ten() {
    let frame = b"MSG foo 1 5\r\nhello\r\n";
    let mut parser = Parser::new();

    let first = parser.feed(&frame[..10]).unwrap();
    assert!(first.is_empty());
    let second = parser.feed(&frame[10..]).unwrap();

    assert_eq!(second.len(), 1);
    let m = msg(&second[0]);
    assert_eq!(m.subject, "foo");
    assert_eq!(m.sid, 1);
    assert_eq!(&m.payload[..], b"hello");
    assert_eq!(parser.stats().snapshot().in_msgs, 1);
    assert_eq!(parser.stats().snapshot().in_bytes, 5);
}

#[test]
fn test_every_two_way_split_matches_whole() {
    let whole = feed_chunks(&[STREAM]);
    for at in 0..=STREAM.len() {
        let split = feed_chunks(&[&STREAM[..at], &STREAM[at..]]);
        assert_eq!(split, whole, "split at {}", at);
    }
}

#[test]
fn test_single_byte_chunks_match_whole() {
    let whole = feed_chunks(&[STREAM]);
    let bytes: Vec<&[u8]> = STREAM.chunks(1).collect();
    assert_eq!(feed_chunks(&bytes), whole);
}

#[test]
fn test_empty_chunks_are_harmless() {
    let whole = feed_chunks(&[STREAM]);
    let mut chunks: Vec<&[u8]> = Vec::new();
    for piece in STREAM.chunks(7) {
        chunks.push(b"");
        chunks.push(piece);
    }
    assert_eq!(feed_chunks(&chunks), whole);
}

#[test]
fn test_large_payload_across_reads() {
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let mut frame = format!("MSG big 2 {}\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(b"\r\nPING\r\n");

    let chunks: Vec<&[u8]> = frame.chunks(333).collect();
    let events = feed_chunks(&chunks);
    assert_eq!(events.len(), 2);
    assert_eq!(&msg(&events[0]).payload[..], &payload[..]);
    assert_eq!(events[1], ParsedEvent::Ping);
}

#[test]
fn test_messages_counted_once_per_frame() {
    let mut parser = Parser::new();
    for chunk in STREAM.chunks(3) {
        parser.feed(chunk).unwrap();
    }
    let stats = parser.stats().snapshot();
    assert_eq!(stats.in_msgs, 4);
    assert_eq!(stats.in_bytes, 5 + 3 + 14);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_msg_wrong_argument_count() {
    for line in [
        &b"MSG foo\r\n"[..],
        b"MSG foo 1\r\n",
        b"MSG foo 1 bar baz 5\r\n",
    ] {
        let err = Parser::new().feed(line).unwrap_err();
        assert!(
            matches!(err, Error::WrongArgCount { op: "MSG", .. }),
            "{:?}",
            err
        );
    }
}

#[test]
fn test_hmsg_wrong_argument_count() {
    for line in [&b"HMSG foo 1 5\r\n"[..], b"HMSG foo 1 r x 2 5\r\n"] {
        let err = Parser::new().feed(line).unwrap_err();
        assert!(matches!(err, Error::WrongArgCount { op: "HMSG", .. }));
    }
}

#[test]
fn test_error_message_text() {
    let err = Parser::new().feed(b"MSG foo\r\n").unwrap_err();
    assert!(err.to_string().contains("wrong number of arguments"));

    let err = Parser::new().feed(b"MSG foo x 5\r\n").unwrap_err();
    assert!(err.to_string().contains("bad or missing sid/size"));

    let err = Parser::new().feed(b"HMSG foo 1 20 10\r\n").unwrap_err();
    assert!(err.to_string().contains("bad or missing header size"));
}

#[test]
fn test_bad_sid_and_size() {
    let cases = [
        &b"MSG foo -1 5\r\n"[..],
        b"MSG foo 1 five\r\n",
        b"MSG foo 1 99999999999999999999999\r\n",
    ];
    for line in cases {
        let err = Parser::new().feed(line).unwrap_err();
        assert!(matches!(err, Error::BadSidOrSize(_)), "{:?}", err);
    }
}

#[test]
fn test_header_larger_than_total() {
    let err = Parser::new().feed(b"HMSG foo 1 15 10\r\n").unwrap_err();
    assert!(matches!(err, Error::BadHeaderSize(_)));
}

#[test]
fn test_error_discards_in_progress_frame() {
    let mut parser = Parser::new();
    let mut events = Vec::new();
    let result = parser.feed_into(b"PONG\r\nMSG a b c d e\r\n", &mut events);

    assert!(result.is_err());
    assert_eq!(events, vec![ParsedEvent::Pong]);
    assert!(parser.is_idle());

    // The parser accepts fresh frames afterwards.
    assert_eq!(parser.feed(b"PING\r\n").unwrap(), vec![ParsedEvent::Ping]);
}

#[test]
fn test_control_line_too_long() {
    let mut parser = Parser::new();
    let mut line = b"INFO ".to_vec();
    line.extend(std::iter::repeat(b'a').take(nats_core::MAX_CONTROL_LINE_SIZE + 1));
    let err = parser.feed(&line).unwrap_err();
    assert!(matches!(err, Error::ControlLineTooLong(_)));
}
