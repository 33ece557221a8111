//! Message framing
//!
//! The byte stream carried by an established connection is segmented into
//! application messages by a framer the embedder supplies per connection.
//! The handler only forwards lists of complete messages plus their total
//! size; it never inspects message contents. A framing violation reported
//! here closes the connection after `on_malformed_message`.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FramingError;

/// Default maximum frame body size accepted by [`LengthDelimitedFramer`]
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Segments a raw byte stream into complete application messages
///
/// The handler feeds every chunk read from the socket into [`split`], which
/// consumes complete messages from the front of the buffer and leaves any
/// partial tail in place for the next read.
///
/// [`split`]: MessageFramer::split
pub trait MessageFramer: Send {
    /// Drain all complete messages from the front of `buf`
    ///
    /// # Errors
    ///
    /// Returns `FramingError` if the stream does not parse; the connection
    /// is then closed.
    fn split(&mut self, buf: &mut BytesMut) -> Result<Vec<Bytes>, FramingError>;
}

/// Length-delimited framing: a big-endian `u32` body length before each body
///
/// This is the stock framer used when the embedder does not install one of
/// its own.
#[derive(Debug, Clone)]
pub struct LengthDelimitedFramer {
    max_frame_size: usize,
}

impl LengthDelimitedFramer {
    /// Frame header size in bytes
    pub const HEADER_SIZE: usize = 4;

    /// Create a framer with a custom maximum body size
    #[must_use]
    pub const fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Prepend the length header to a message body
    ///
    /// The inverse of [`split`](MessageFramer::split), offered as a
    /// convenience for embedders that use the stock framing on the wire.
    #[must_use]
    pub fn encode(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_SIZE + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }
}

impl Default for LengthDelimitedFramer {
    fn default() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl MessageFramer for LengthDelimitedFramer {
    fn split(&mut self, buf: &mut BytesMut) -> Result<Vec<Bytes>, FramingError> {
        let mut messages = Vec::new();

        loop {
            if buf.len() < Self::HEADER_SIZE {
                break;
            }

            let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if length > self.max_frame_size {
                return Err(FramingError::Oversized {
                    length,
                    max: self.max_frame_size,
                });
            }

            if buf.len() < Self::HEADER_SIZE + length {
                break;
            }

            buf.advance(Self::HEADER_SIZE);
            messages.push(buf.split_to(length).freeze());
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(bodies: &[&[u8]]) -> BytesMut {
        let mut buf = BytesMut::new();
        for body in bodies {
            buf.extend_from_slice(&LengthDelimitedFramer::encode(body));
        }
        buf
    }

    #[test]
    fn test_single_message() {
        let mut framer = LengthDelimitedFramer::default();
        let mut buf = framed(&[b"hello"]);

        let msgs = framer.split(&mut buf).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0][..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_messages_one_read() {
        let mut framer = LengthDelimitedFramer::default();
        let mut buf = framed(&[b"one", b"two", b"three"]);

        let msgs = framer.split(&mut buf).unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(&msgs[1][..], b"two");
    }

    #[test]
    fn test_partial_header_and_body() {
        let mut framer = LengthDelimitedFramer::default();
        let full = framed(&[b"partial"]);

        // Feed two bytes of header: nothing should come out
        let mut buf = BytesMut::from(&full[..2]);
        assert!(framer.split(&mut buf).unwrap().is_empty());
        assert_eq!(buf.len(), 2);

        // Complete the header but not the body
        buf.extend_from_slice(&full[2..6]);
        assert!(framer.split(&mut buf).unwrap().is_empty());

        // Complete the message
        buf.extend_from_slice(&full[6..]);
        let msgs = framer.split(&mut buf).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0][..], b"partial");
    }

    #[test]
    fn test_empty_body() {
        let mut framer = LengthDelimitedFramer::default();
        let mut buf = framed(&[b""]);

        let msgs = framer.split(&mut buf).unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut framer = LengthDelimitedFramer::with_max_frame_size(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&17u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 17]);

        let err = framer.split(&mut buf).unwrap_err();
        assert!(matches!(err, FramingError::Oversized { length: 17, max: 16 }));
    }

    #[test]
    fn test_tail_preserved_after_complete_message() {
        let mut framer = LengthDelimitedFramer::default();
        let mut buf = framed(&[b"done"]);
        buf.extend_from_slice(&[0x00, 0x00]); // partial next header

        let msgs = framer.split(&mut buf).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(buf.len(), 2);
    }
}
