//! Reliable-transport frame codec.
//!
//! Every message on the TCP transport is a 4-byte little-endian signed
//! length header followed by that many bytes of payload. Payloads larger
//! than [`COMPRESS_THRESHOLD`] are zlib-compressed and prefixed with the
//! [`ABG_MAGIC`] marker before the header is computed, so the header always
//! describes the number of bytes actually on the wire.
//!
//! Datagram framing has no header at all: byte 0 of a UDP packet is the
//! sender's slot id plus one (see [`datagram_slot`]).

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{RelayError, Result};

/// Marker prefix identifying a zlib-compressed reliable payload.
pub const ABG_MAGIC: &[u8] = b"ABG:";

/// Payloads strictly larger than this are compressed before framing.
pub const COMPRESS_THRESHOLD: usize = 400;

/// Any header claiming more than this many bytes is treated as malicious.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Encode `payload` into a complete wire frame: optional `ABG:` compression
/// plus the 4-byte little-endian signed length header.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let body = if payload.len() > COMPRESS_THRESHOLD {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;
        let mut framed = Vec::with_capacity(ABG_MAGIC.len() + compressed.len());
        framed.extend_from_slice(ABG_MAGIC);
        framed.extend_from_slice(&compressed);
        framed
    } else {
        payload.to_vec()
    };

    if body.len() > MAX_FRAME_SIZE {
        return Err(RelayError::PeerMalformed(format!(
            "outbound frame of {} bytes exceeds {} byte limit",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as i32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Outcome of reading one frame off a reliable stream.
pub enum Frame {
    /// A complete, decompressed payload.
    Payload(Vec<u8>),
    /// The peer closed the connection cleanly (zero-length read on the header).
    Closed,
}

/// Read one length-prefixed frame from `reader`, decompressing it if it
/// carries the `ABG:` marker.
///
/// A non-positive header is fatal per the wire contract: the only valid
/// "nothing more to read" signal is an empty header, which maps to
/// [`Frame::Closed`]. Anything else non-positive, or a header above
/// [`MAX_FRAME_SIZE`], is reported as [`RelayError::PeerMalformed`] so the
/// caller can kick the peer.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; 4];
    match read_exact_or_eof(reader, &mut header)? {
        0 => return Ok(Frame::Closed),
        4 => {}
        n => {
            return Err(RelayError::PeerMalformed(format!(
                "truncated frame header ({n} of 4 bytes)"
            )));
        }
    }

    let len = i32::from_le_bytes(header);
    if len <= 0 {
        return Err(RelayError::PeerMalformed(format!(
            "non-positive frame header: {len}"
        )));
    }
    let len = len as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RelayError::PeerMalformed(format!(
            "frame header {len} exceeds {MAX_FRAME_SIZE} byte limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    if body.len() > ABG_MAGIC.len() && body.starts_with(ABG_MAGIC) {
        let mut decoder = ZlibDecoder::new(&body[ABG_MAGIC.len()..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(Frame::Payload(decompressed))
    } else {
        Ok(Frame::Payload(body))
    }
}

/// Like `Read::read_exact`, but returns the number of bytes actually read
/// instead of erroring when the peer closes before filling `buf` — lets the
/// caller distinguish a clean close (0 bytes) from a truncated header.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// True if `err` came from `read_frame` rejecting a header above
/// [`MAX_FRAME_SIZE`] — the one malformed-frame case the wire protocol asks
/// the caller to report back to the peer before closing (`Header size limit
/// exceeded`), as opposed to a truncated header or negative length, which
/// close silently.
pub fn is_oversize_header(err: &RelayError) -> bool {
    matches!(err, RelayError::PeerMalformed(msg) if msg.contains("exceeds"))
}

/// Slot id encoded in byte 0 of an inbound datagram (`byte - 1`), or `None`
/// if the datagram is empty. Outbound datagrams carry no such prefix: the
/// server already knows each session's peer address and writes straight to
/// it, so the slot byte exists only to let the shared receive socket demux
/// incoming traffic from many peers.
pub fn datagram_slot(packet: &[u8]) -> Option<i32> {
    packet.first().map(|&b| b as i32 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_small_uncompressed_payload() {
        let payload = b"hello".to_vec();
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(&frame[4..], &payload[..]);
        let mut cursor = Cursor::new(frame);
        match read_frame(&mut cursor).unwrap() {
            Frame::Payload(p) => assert_eq!(p, payload),
            Frame::Closed => panic!("expected payload"),
        }
    }

    #[test]
    fn payload_at_exactly_threshold_is_not_compressed() {
        let payload = vec![b'x'; COMPRESS_THRESHOLD];
        let frame = encode_frame(&payload).unwrap();
        assert!(!frame[4..].starts_with(ABG_MAGIC));
    }

    #[test]
    fn payload_over_threshold_is_compressed_and_round_trips() {
        let payload = vec![b'y'; COMPRESS_THRESHOLD + 1];
        let frame = encode_frame(&payload).unwrap();
        assert!(frame[4..].starts_with(ABG_MAGIC));
        let mut cursor = Cursor::new(frame);
        match read_frame(&mut cursor).unwrap() {
            Frame::Payload(p) => assert_eq!(p, payload),
            Frame::Closed => panic!("expected payload"),
        }
    }

    #[test]
    fn empty_header_is_clean_close() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_frame(&mut cursor).unwrap(), Frame::Closed));
    }

    #[test]
    fn non_positive_header_is_malformed() {
        let mut cursor = Cursor::new(0i32.to_le_bytes().to_vec());
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn oversize_header_is_malformed() {
        let mut cursor = Cursor::new(((MAX_FRAME_SIZE + 1) as i32).to_le_bytes().to_vec());
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(is_oversize_header(&err));
    }

    #[test]
    fn truncated_header_is_not_an_oversize_header() {
        let mut cursor = Cursor::new(vec![1u8, 0]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(!is_oversize_header(&err));
    }

    #[test]
    fn datagram_slot_decodes_byte_zero() {
        let packet = [4u8, 0, b'p'];
        assert_eq!(datagram_slot(&packet), Some(3));
    }
}
