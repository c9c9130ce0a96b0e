//! Messages and envelopes exchanged on the remote streaming protocol.

use bytes::Bytes;
use camlink_core::{Frame, FrameMetadata, VideoFormat};
use serde::{Deserialize, Serialize};

/// One protocol message. Externally tagged, so the serialized form is the
/// wire tag itself (`image`, `started_playing`, ...).
///
/// There is deliberately no end-of-stream variant: local queue sentinels
/// are separate enum arms in the client/server command types and can never
/// be serialized onto the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// One frame; the binary planes ride outside the text section.
    Image(ImageHeader),
    /// Client asks to receive frames.
    StartedPlaying,
    /// Client stops receiving frames; also sent by the server as the ack.
    StoppedPlaying,
    /// Server is (or has started) recording with this negotiated format.
    StartedRecording(VideoFormat),
    /// Server stopped recording; the client should stop playing.
    StoppedRecording,
    /// Recoverable peer-side failure; the connection stays up.
    Exception(RemoteError),
    /// Fatal peer-side failure; the connection is unusable.
    ExceptionExit(RemoteError),
}

impl Message {
    /// The wire tag, for logs and error messages.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Image(_) => "image",
            Message::StartedPlaying => "started_playing",
            Message::StoppedPlaying => "stopped_playing",
            Message::StartedRecording(_) => "started_recording",
            Message::StoppedRecording => "stopped_recording",
            Message::Exception(_) => "exception",
            Message::ExceptionExit(_) => "exception_exit",
        }
    }
}

/// Error report forwarded across the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    /// Backtrace or context from the reporting side, if any.
    pub trace: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: String::new(),
        }
    }
}

/// Layout of the binary planes attached to an `image` message.
///
/// Plane boundaries are carried here, inside the structured text section;
/// the frame header on the wire only knows the aggregate binary length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub plane_sizes: Vec<u32>,
    pub pix_fmt: String,
    pub width: u32,
    pub height: u32,
    pub linesizes: Vec<u32>,
    pub meta: FrameMetadata,
}

/// One framed unit on the wire: a message plus the binary planes an
/// `image` message carries. Every other message has an empty plane list.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub planes: Vec<Bytes>,
}

impl Envelope {
    /// Envelope with no binary section.
    pub fn control(message: Message) -> Self {
        debug_assert!(!matches!(message, Message::Image(_)));
        Self {
            message,
            planes: Vec::new(),
        }
    }

    /// Envelope carrying one frame; plane sizes are derived from the frame
    /// itself so header and payload cannot disagree.
    pub fn image(frame: &Frame, meta: FrameMetadata) -> Self {
        let header = ImageHeader {
            plane_sizes: frame.planes.iter().map(|p| p.len() as u32).collect(),
            pix_fmt: frame.pix_fmt.clone(),
            width: frame.width,
            height: frame.height,
            linesizes: frame.linesizes.clone(),
            meta,
        };
        Self {
            message: Message::Image(header),
            planes: frame.planes.clone(),
        }
    }

    /// Reassemble the frame carried by an `image` envelope; `None` for any
    /// other tag.
    pub fn into_frame(self) -> Option<(Frame, FrameMetadata)> {
        match self.message {
            Message::Image(header) => Some((
                Frame {
                    pix_fmt: header.pix_fmt,
                    width: header.width,
                    height: header.height,
                    linesizes: header.linesizes,
                    planes: self.planes,
                },
                header.meta,
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_the_wire_names() {
        let json = serde_json::to_string(&Message::StartedPlaying).unwrap();
        assert_eq!(json, "\"started_playing\"");

        let json =
            serde_json::to_string(&Message::StartedRecording(VideoFormat::default())).unwrap();
        assert!(json.starts_with("{\"started_recording\""));
    }

    #[test]
    fn image_round_trips_through_its_header() {
        let frame = Frame {
            pix_fmt: "yuv420p".into(),
            width: 4,
            height: 2,
            linesizes: vec![4, 2, 2],
            planes: vec![
                Bytes::from_static(b"aaaaaaaa"),
                Bytes::from_static(b"bb"),
                Bytes::from_static(b"cc"),
            ],
        };
        let meta = FrameMetadata::with_count(0.5, 7);
        let envelope = Envelope::image(&frame, meta);
        match &envelope.message {
            Message::Image(header) => assert_eq!(header.plane_sizes, vec![8, 2, 2]),
            other => panic!("unexpected message {}", other.tag()),
        }
        let (rebuilt, rebuilt_meta) = envelope.into_frame().unwrap();
        assert_eq!(rebuilt, frame);
        assert_eq!(rebuilt_meta, meta);
    }

    #[test]
    fn into_frame_rejects_control_messages() {
        assert!(Envelope::control(Message::StoppedRecording)
            .into_frame()
            .is_none());
    }
}
