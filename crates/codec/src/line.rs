use bytes::{Buf, BytesMut};

use crate::{Error, SignalingMessage, decode};

/// Upper bound of a single line. Session descriptions are a few kilobytes at
/// most, anything beyond this is not a signaling peer.
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Incremental newline splitter used when reading signaling messages over
/// TCP.
///
/// Bytes read from the socket are appended to the internal buffer, each call
/// to [`LineDecoder::next_message`] consumes at most one complete line. A
/// partial line stays in the buffer until the rest of it arrives.
///
/// # Test
///
/// ```
/// use mirror_link_codec::{LineDecoder, MessageKind};
///
/// let mut decoder = LineDecoder::default();
/// decoder.extend(b"{\"type\":\"offer\",\"data\":\"a\"}\n{\"type\":\"ans");
///
/// let message = decoder.next_message().unwrap().unwrap();
/// assert_eq!(message.kind, MessageKind::Offer);
/// assert!(decoder.next_message().is_none());
///
/// decoder.extend(b"wer\",\"data\":\"b\"}\n");
/// let message = decoder.next_message().unwrap().unwrap();
/// assert_eq!(message.kind, MessageKind::Answer);
/// assert_eq!(message.payload, "b");
/// ```
pub struct LineDecoder {
    buffer: BytesMut,
    max_line_size: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line_size(MAX_LINE_SIZE)
    }
}

impl LineDecoder {
    pub fn with_max_line_size(max_line_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_line_size,
        }
    }

    /// The read side of the socket writes directly into this buffer.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take the next complete line out of the buffer and decode it.
    ///
    /// Returns `None` when no complete line is buffered. A malformed line is
    /// consumed and reported as an error, the lines after it are unaffected.
    /// Blank lines are skipped.
    pub fn next_message(&mut self) -> Option<Result<SignalingMessage, Error>> {
        loop {
            let Some(position) = self.buffer.iter().position(|it| *it == b'\n') else {
                // The line keeps growing without a delimiter, drop everything
                // buffered so far rather than growing without bound.
                if self.buffer.len() > self.max_line_size {
                    self.buffer.clear();
                    return Some(Err(Error::LineTooLong));
                }

                return None;
            };

            let line = self.buffer.split_to(position);
            self.buffer.advance(1);

            if line.iter().all(|it| it.is_ascii_whitespace()) {
                continue;
            }

            return Some(decode(&line));
        }
    }
}
