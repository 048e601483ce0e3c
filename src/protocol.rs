//! Packet framing for the line protocol.
//!
//! A packet is any byte sequence terminated by a single `\n`. The server
//! expects at most one packet per connection. A chunk that ends the packet
//! early may carry extra bytes after the terminator, and those are dropped.

/// Packet terminator.
pub const TERMINATOR: u8 = b'\n';

/// Result of scanning one received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// No terminator yet; the whole chunk belongs to the packet.
    Partial,
    /// The packet ends inside this chunk.
    Complete {
        /// Bytes of the chunk that belong to the packet, terminator included.
        len: usize,
        /// Bytes after the terminator that are discarded.
        trailing: usize,
    },
}

/// Scan a received chunk for the packet terminator.
pub fn scan(chunk: &[u8]) -> Frame {
    match chunk.iter().position(|&b| b == TERMINATOR) {
        Some(pos) => Frame::Complete {
            len: pos + 1,
            trailing: chunk.len() - pos - 1,
        },
        None => Frame::Partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial() {
        assert_eq!(scan(b"hello"), Frame::Partial);
        assert_eq!(scan(b""), Frame::Partial);
    }

    #[test]
    fn test_complete_at_end() {
        assert_eq!(
            scan(b"hello\n"),
            Frame::Complete {
                len: 6,
                trailing: 0
            }
        );
    }

    #[test]
    fn test_trailing_bytes_reported() {
        assert_eq!(
            scan(b"one\ntwo\n"),
            Frame::Complete {
                len: 4,
                trailing: 4
            }
        );
    }

    #[test]
    fn test_bare_terminator() {
        assert_eq!(
            scan(b"\n"),
            Frame::Complete {
                len: 1,
                trailing: 0
            }
        );
    }
}
