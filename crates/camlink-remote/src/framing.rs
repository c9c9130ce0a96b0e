//! Length-prefixed framing for protocol envelopes.
//!
//! Wire layout per envelope:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────┬──────────────────┐
//! │  text length │ binary length│  text section   │  binary section  │
//! │  (u32 BE)    │  (u32 BE)    │  (JSON message) │  (planes, concat)│
//! └──────────────┴──────────────┴─────────────────┴──────────────────┘
//! ```
//!
//! Only `image` messages have a binary section; its per-plane boundaries
//! are recovered from the plane sizes inside the text section, since the
//! header carries only the aggregate length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::envelope::{Envelope, Message};

/// Fixed header size: two big-endian u32 lengths.
pub const HEADER_SIZE: usize = 8;

/// Maximum structured-text section (64 KiB).
pub const MAX_TEXT_SIZE: usize = 64 * 1024;

/// Maximum binary section (64 MiB covers raw frames well past 4K).
pub const MAX_BINARY_SIZE: usize = 64 * 1024 * 1024;

/// Framing error. Any of these ends the connection; the decoder makes no
/// attempt to resynchronize a corrupt stream.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("section of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("malformed message text: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("declared plane sizes sum to {declared} bytes but the binary section is {actual}")]
    PlaneMismatch { declared: usize, actual: usize },

    #[error("{tag} message carries a binary section")]
    UnexpectedBinary { tag: &'static str },
}

/// Encode one envelope to wire bytes.
pub fn encode(envelope: &Envelope) -> Result<Bytes, FramingError> {
    let text = serde_json::to_vec(&envelope.message)?;
    if text.len() > MAX_TEXT_SIZE {
        return Err(FramingError::TooLarge {
            len: text.len(),
            max: MAX_TEXT_SIZE,
        });
    }
    let binary_len: usize = envelope.planes.iter().map(|p| p.len()).sum();
    if binary_len > MAX_BINARY_SIZE {
        return Err(FramingError::TooLarge {
            len: binary_len,
            max: MAX_BINARY_SIZE,
        });
    }
    if binary_len > 0 && !matches!(envelope.message, Message::Image(_)) {
        return Err(FramingError::UnexpectedBinary {
            tag: envelope.message.tag(),
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + text.len() + binary_len);
    buf.put_u32(text.len() as u32);
    buf.put_u32(binary_len as u32);
    buf.put_slice(&text);
    for plane in &envelope.planes {
        buf.put_slice(plane);
    }
    Ok(buf.freeze())
}

enum DecodeState {
    AwaitingHeader,
    AwaitingBody { text_len: usize, binary_len: usize },
}

/// Incremental envelope decoder.
///
/// Re-entrant over partial reads: feed it whatever bytes the socket
/// currently has (down to one at a time) and poll [`Decoder::next`] for
/// completed envelopes. After an error the stream position is undefined
/// and the connection must be torn down.
pub struct Decoder {
    buf: BytesMut,
    state: DecodeState,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: DecodeState::AwaitingHeader,
        }
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete envelope, if the buffer holds one.
    pub fn next(&mut self) -> Result<Option<Envelope>, FramingError> {
        if let DecodeState::AwaitingHeader = self.state {
            if self.buf.len() < HEADER_SIZE {
                return Ok(None);
            }
            let mut header = &self.buf[..HEADER_SIZE];
            let text_len = header.get_u32() as usize;
            let binary_len = header.get_u32() as usize;
            if text_len > MAX_TEXT_SIZE {
                return Err(FramingError::TooLarge {
                    len: text_len,
                    max: MAX_TEXT_SIZE,
                });
            }
            if binary_len > MAX_BINARY_SIZE {
                return Err(FramingError::TooLarge {
                    len: binary_len,
                    max: MAX_BINARY_SIZE,
                });
            }
            self.buf.advance(HEADER_SIZE);
            self.state = DecodeState::AwaitingBody {
                text_len,
                binary_len,
            };
        }

        if let DecodeState::AwaitingBody {
            text_len,
            binary_len,
        } = self.state
        {
            if self.buf.len() < text_len + binary_len {
                return Ok(None);
            }
            let text = self.buf.split_to(text_len);
            let mut binary = self.buf.split_to(binary_len).freeze();
            self.state = DecodeState::AwaitingHeader;

            let message: Message = serde_json::from_slice(&text)?;
            let planes = match &message {
                Message::Image(header) => {
                    let declared: usize =
                        header.plane_sizes.iter().map(|&n| n as usize).sum();
                    if declared != binary.len() {
                        return Err(FramingError::PlaneMismatch {
                            declared,
                            actual: binary.len(),
                        });
                    }
                    header
                        .plane_sizes
                        .iter()
                        .map(|&n| binary.split_to(n as usize))
                        .collect()
                }
                _ if !binary.is_empty() => {
                    return Err(FramingError::UnexpectedBinary {
                        tag: message.tag(),
                    })
                }
                _ => Vec::new(),
            };
            return Ok(Some(Envelope { message, planes }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RemoteError;
    use camlink_core::{Frame, FrameMetadata, VideoFormat};
    use proptest::prelude::*;

    fn image_envelope(plane_sizes: &[usize]) -> Envelope {
        let planes: Vec<Bytes> = plane_sizes
            .iter()
            .enumerate()
            .map(|(i, &len)| Bytes::from(vec![i as u8 + 1; len]))
            .collect();
        let frame = Frame {
            pix_fmt: "yuv420p".into(),
            width: 10,
            height: 10,
            linesizes: vec![10; plane_sizes.len()],
            planes,
        };
        Envelope::image(&frame, FrameMetadata::with_count(1.25, 42))
    }

    fn decode_all(decoder: &mut Decoder) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(envelope) = decoder.next().unwrap() {
            out.push(envelope);
        }
        out
    }

    #[test]
    fn control_message_round_trips() {
        let envelope = Envelope::control(Message::StartedRecording(VideoFormat::new(
            "rgb24", 320, 240, 15.0,
        )));
        let bytes = encode(&envelope).unwrap();

        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        let decoded = decode_all(&mut decoder);
        assert_eq!(decoded, vec![envelope]);
    }

    #[test]
    fn image_planes_keep_their_boundaries() {
        let envelope = image_envelope(&[100, 50, 25]);
        let bytes = encode(&envelope).unwrap();

        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        let decoded = decode_all(&mut decoder);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].planes.len(), 3);
        assert_eq!(decoded[0].planes[0], Bytes::from(vec![1u8; 100]));
        assert_eq!(decoded[0].planes[1], Bytes::from(vec![2u8; 50]));
        assert_eq!(decoded[0].planes[2], Bytes::from(vec![3u8; 25]));
        assert_eq!(decoded[0], envelope);
    }

    #[test]
    fn decodes_one_byte_at_a_time() {
        let envelope = image_envelope(&[100, 50, 25]);
        let bytes = encode(&envelope).unwrap();

        let mut decoder = Decoder::new();
        let mut decoded = Vec::new();
        for byte in bytes.iter() {
            decoder.feed(std::slice::from_ref(byte));
            decoded.extend(decode_all(&mut decoder));
        }
        assert_eq!(decoded, vec![envelope]);
    }

    #[test]
    fn decodes_back_to_back_envelopes_from_one_buffer() {
        let first = Envelope::control(Message::StartedPlaying);
        let second = image_envelope(&[10]);
        let third = Envelope::control(Message::StoppedPlaying);

        let mut stream = BytesMut::new();
        for envelope in [&first, &second, &third] {
            stream.extend_from_slice(&encode(envelope).unwrap());
        }

        let mut decoder = Decoder::new();
        decoder.feed(&stream);
        assert_eq!(decode_all(&mut decoder), vec![first, second, third]);
    }

    #[test]
    fn empty_plane_list_is_valid() {
        // An image with zero planes has an empty binary section.
        let envelope = image_envelope(&[]);
        let bytes = encode(&envelope).unwrap();
        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        assert_eq!(decode_all(&mut decoder), vec![envelope]);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut decoder = Decoder::new();
        let mut bytes = BytesMut::new();
        bytes.put_u32((MAX_TEXT_SIZE + 1) as u32);
        bytes.put_u32(0);
        decoder.feed(&bytes);
        assert!(matches!(
            decoder.next(),
            Err(FramingError::TooLarge { .. })
        ));
    }

    #[test]
    fn plane_size_mismatch_is_rejected() {
        let envelope = image_envelope(&[10, 10]);
        let bytes = encode(&envelope).unwrap();
        // Truncate one payload byte and patch the header's binary length
        // so the total still "completes".
        let mut corrupted = BytesMut::from(&bytes[..bytes.len() - 1]);
        let binary_len = 19u32;
        corrupted[4..8].copy_from_slice(&binary_len.to_be_bytes());

        let mut decoder = Decoder::new();
        decoder.feed(&corrupted);
        assert!(matches!(
            decoder.next(),
            Err(FramingError::PlaneMismatch {
                declared: 20,
                actual: 19
            })
        ));
    }

    #[test]
    fn binary_on_control_message_is_rejected() {
        let text = serde_json::to_vec(&Message::StoppedPlaying).unwrap();
        let mut bytes = BytesMut::new();
        bytes.put_u32(text.len() as u32);
        bytes.put_u32(4);
        bytes.put_slice(&text);
        bytes.put_slice(b"oops");

        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        assert!(matches!(
            decoder.next(),
            Err(FramingError::UnexpectedBinary {
                tag: "stopped_playing"
            })
        ));
    }

    #[test]
    fn encode_rejects_planes_on_control_messages() {
        let envelope = Envelope {
            message: Message::Exception(RemoteError::new("boom")),
            planes: vec![Bytes::from_static(b"data")],
        };
        assert!(matches!(
            encode(&envelope),
            Err(FramingError::UnexpectedBinary { tag: "exception" })
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip_survives_arbitrary_chunking(
            plane_sizes in prop::collection::vec(0usize..2000, 0..4),
            chunk in 1usize..64,
        ) {
            let envelope = image_envelope(&plane_sizes);
            let bytes = encode(&envelope).unwrap();

            let mut decoder = Decoder::new();
            let mut decoded = Vec::new();
            for piece in bytes.chunks(chunk) {
                decoder.feed(piece);
                while let Some(e) = decoder.next().unwrap() {
                    decoded.push(e);
                }
            }
            prop_assert_eq!(decoded, vec![envelope]);
        }
    }
}
