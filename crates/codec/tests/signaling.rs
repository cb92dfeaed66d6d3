use anyhow::Result;
use mirror_link_codec::{Error, LineDecoder, MessageKind, SignalingMessage, decode, encode, line::MAX_LINE_SIZE};

#[rustfmt::skip]
mod samples {
    pub const OFFER: &[u8] = b"{\"type\":\"offer\",\"data\":\"{\\\"type\\\":\\\"OFFER\\\",\\\"description\\\":\\\"v=0\\\\r\\\\no=- 46117 2 IN IP4 127.0.0.1\\\\r\\\\n\\\"}\"}\n";
    pub const ANSWER: &[u8] = b"{\"type\":\"answer\",\"data\":\"{\\\"type\\\":\\\"ANSWER\\\",\\\"description\\\":\\\"v=0\\\"}\"}\n";
    pub const CANDIDATE: &[u8] = b"{\"type\":\"ice_candidate\",\"data\":\"{\\\"sdpMid\\\":\\\"0\\\",\\\"sdpMLineIndex\\\":0,\\\"sdp\\\":\\\"candidate:1 1 udp 2122260223 192.168.49.1 40412 typ host\\\"}\"}\n";
}

#[test]
fn test_decode_samples() -> Result<()> {
    let offer = decode(samples::OFFER)?;
    assert_eq!(offer.kind, MessageKind::Offer);
    assert!(offer.payload.contains("o=- 46117 2 IN IP4 127.0.0.1"));

    let answer = decode(samples::ANSWER)?;
    assert_eq!(answer.kind, MessageKind::Answer);
    assert!(answer.kind.is_description());

    let candidate = decode(samples::CANDIDATE)?;
    assert_eq!(candidate.kind, MessageKind::IceCandidate);
    assert!(!candidate.kind.is_description());
    assert!(candidate.payload.contains("typ host"));

    Ok(())
}

#[test]
fn test_encoded_message_is_a_single_line() -> Result<()> {
    // Payloads produced by media engines contain newlines of their own, they
    // must be escaped so the frame stays on one line.
    let message = SignalingMessage::offer("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
    let bytes = encode(&message);

    assert_eq!(bytes.iter().filter(|it| **it == b'\n').count(), 1);
    assert_eq!(bytes.last(), Some(&b'\n'));
    assert_eq!(decode(&bytes)?, message);

    Ok(())
}

#[test]
fn test_decode_rejects_malformed_lines() {
    assert!(matches!(decode(b"not json"), Err(Error::Json(_))));
    assert!(matches!(decode(b"{\"type\":\"offer\"}"), Err(Error::Json(_))));
    assert!(matches!(decode(b"{\"type\":\"hello\",\"data\":\"x\"}"), Err(Error::UnknownKind(kind)) if kind == "hello"));
    assert!(matches!(decode(b"\n"), Err(Error::EmptyLine)));
    assert!(matches!(decode(&[0xff, 0xfe, b'\n']), Err(Error::Utf8(_))));
}

#[test]
fn test_decode_ignores_unknown_fields() -> Result<()> {
    let message = decode(b"{\"type\":\"answer\",\"data\":\"sdp\",\"version\":2}")?;
    assert_eq!(message, SignalingMessage::answer("sdp"));

    Ok(())
}

#[test]
fn test_line_decoder_keeps_going_after_malformed_line() -> Result<()> {
    let mut decoder = LineDecoder::default();
    decoder.extend(b"garbage\n\n");
    decoder.extend(samples::CANDIDATE);

    assert!(matches!(decoder.next_message(), Some(Err(Error::Json(_)))));

    let message = decoder.next_message().transpose()?;
    assert_eq!(message.map(|it| it.kind), Some(MessageKind::IceCandidate));
    assert!(decoder.next_message().is_none());
    assert!(decoder.is_empty());

    Ok(())
}

#[test]
fn test_line_decoder_preserves_order_across_reads() -> Result<()> {
    let mut stream = Vec::new();
    stream.extend_from_slice(samples::OFFER);
    stream.extend_from_slice(samples::CANDIDATE);
    stream.extend_from_slice(samples::ANSWER);

    let mut decoder = LineDecoder::default();
    let mut kinds = Vec::new();

    // Feed the stream in small uneven chunks like a slow socket would.
    for chunk in stream.chunks(7) {
        decoder.extend(chunk);

        while let Some(message) = decoder.next_message() {
            kinds.push(message?.kind);
        }
    }

    assert_eq!(
        kinds,
        vec![MessageKind::Offer, MessageKind::IceCandidate, MessageKind::Answer]
    );

    Ok(())
}

#[test]
fn test_line_decoder_drops_oversized_line() {
    let mut decoder = LineDecoder::with_max_line_size(16);
    decoder.extend(&[b'x'; 32]);

    assert!(matches!(decoder.next_message(), Some(Err(Error::LineTooLong))));
    assert!(decoder.is_empty());

    assert!(MAX_LINE_SIZE >= 64 * 1024);
}
