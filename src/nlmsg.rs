//! Netlink-style framed control messages.
//!
//! The sandbox control plane frames requests the way netlink does: a 16-byte
//! header carrying the total message length, followed by the payload, with
//! the whole message padded to 4-byte alignment. Several messages may be
//! packed back to back in one datagram.

/// Wire size of a [`MessageHeader`].
pub const HEADER_SIZE: usize = 16;

/// Messages are padded to this alignment.
pub const ALIGNMENT: usize = 4;

fn align_up(len: usize) -> usize {
    len.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// The fixed message header, all fields little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message length, header included, padding excluded.
    pub length: u32,
    pub type_: u16,
    pub flags: u16,
    pub seq: u32,
    pub port_id: u32,
}

impl MessageHeader {
    fn parse(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            type_: u16::from_le_bytes([buf[4], buf[5]]),
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            seq: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            port_id: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// Parse one framed message off the front of `buf`.
///
/// On success returns the header, the payload (the `length - 16` bytes after
/// the header), and the residual buffer past the message's padding. The last
/// message in a buffer may omit trailing padding, matching Linux.
///
/// Returns `None` when the buffer is too short for a header, the length
/// field is smaller than the header, or the length field overruns the
/// buffer.
pub fn parse_message(buf: &[u8]) -> Option<(MessageHeader, &[u8], &[u8])> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&buf[..HEADER_SIZE]);
    let header = MessageHeader::parse(&raw);

    let total = header.length as usize;
    if total < HEADER_SIZE || total > buf.len() {
        return None;
    }
    let payload = &buf[HEADER_SIZE..total];
    let consumed = align_up(total).min(buf.len());
    Some((header, payload, &buf[consumed..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: [u8; 20] = [
        0x14, 0x00, 0x00, 0x00, // length
        0x01, 0x00, // type
        0x02, 0x00, // flags
        0x03, 0x00, 0x00, 0x00, // seq
        0x04, 0x00, 0x00, 0x00, // port id
        0x30, 0x31, 0x00, 0x00, // payload with 2 bytes padding
    ];

    const EXPECTED: MessageHeader = MessageHeader {
        length: 20,
        type_: 1,
        flags: 2,
        seq: 3,
        port_id: 4,
    };

    #[test]
    fn parses_a_valid_message() {
        let (header, payload, rest) = parse_message(&VALID).expect("valid frame");
        assert_eq!(header, EXPECTED);
        assert_eq!(
            u16::from_le_bytes([payload[0], payload[1]]),
            0x3130,
            "payload should decode little-endian"
        );
        assert!(rest.is_empty(), "nothing should remain after the message");
    }

    #[test]
    fn reports_the_residual_after_a_trailing_byte() {
        let mut buf = VALID.to_vec();
        buf.push(0xFF);
        let (header, _, rest) = parse_message(&buf).expect("valid frame with residue");
        assert_eq!(header, EXPECTED);
        assert_eq!(rest.len(), 1, "the trailing byte belongs to the next message");
        assert_eq!(rest[0], 0xFF);
    }

    #[test]
    fn rejects_a_length_shorter_than_the_header() {
        let mut buf = VALID;
        buf[0] = 0x04;
        assert!(parse_message(&buf).is_none());
    }

    #[test]
    fn rejects_a_length_beyond_the_buffer() {
        let mut buf = VALID;
        buf[0] = 0xFF;
        buf[1] = 0xFF;
        assert!(parse_message(&buf).is_none());
    }

    #[test]
    fn rejects_a_truncated_header() {
        assert!(parse_message(&VALID[..10]).is_none());
    }

    #[test]
    fn consumes_padding_between_packed_messages() {
        // length 18: two payload bytes, two padding bytes before the next
        // message starts.
        let mut first = VALID;
        first[0] = 0x12;
        let mut buf = first.to_vec();
        buf.extend_from_slice(&VALID);

        let (_, payload, rest) = parse_message(&buf).expect("first frame");
        assert_eq!(payload.len(), 2);
        let (header, _, rest) = parse_message(rest).expect("second frame");
        assert_eq!(header, EXPECTED);
        assert!(rest.is_empty());
    }
}
