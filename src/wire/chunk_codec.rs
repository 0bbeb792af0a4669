use crate::wire::binary_frame::ChunkFrame;
use crate::wire::compression::Compression;
use crate::wire::control_frame::{ControlFrame, MessageStart};
use crate::wire::message_id::MessageId;
use crate::wire::{MessageType, WireFrame};

/// A message ready for transmission: its body is already compressed with the declared scheme.
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub id: MessageId,
    pub message_type: MessageType,
    pub compression: Compression,
    pub metadata: String,
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    pub fn start_frame(&self) -> ControlFrame {
        ControlFrame::Start(MessageStart {
            id: self.id.clone(),
            content_length: self.body.len(),
            message_type: self.message_type,
            compression: self.compression,
            metadata: self.metadata.clone(),
        })
    }

    /// Splits the message into its complete frame sequence: one start header, a range header
    ///  and a binary chunk per slice, and the end marker. The last slice holds the remainder,
    ///  so there is never an empty chunk frame.
    pub fn encode_frames(&self, slice_size: usize) -> Vec<WireFrame> {
        assert!(slice_size > 0, "slice size must be positive");

        let num_slices = self.body.len().div_ceil(slice_size);
        let mut frames = Vec::with_capacity(2 + 2 * num_slices);

        frames.push(WireFrame::Text(self.start_frame().to_text()));

        for (index, slice) in self.body.chunks(slice_size).enumerate() {
            let start = index * slice_size;
            frames.push(WireFrame::Text(ControlFrame::Range {
                id: self.id.clone(),
                start,
                end: start + slice.len(),
            }.to_text()));
            frames.push(WireFrame::Binary(ChunkFrame::encode(&self.id, slice)));
        }

        frames.push(WireFrame::Text(ControlFrame::End { id: self.id.clone() }.to_text()));
        frames
    }
}

pub fn ack_frame(id: MessageId, iid: &str, accepted: bool) -> WireFrame {
    WireFrame::Text(ControlFrame::Ack {
        id,
        iid: iid.to_string(),
        accepted,
    }.to_text())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn message(body: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage {
            id: MessageId::parse("AbCd-_12").unwrap(),
            message_type: MessageType::ActionReturn,
            compression: Compression::None,
            metadata: "iid-1".to_string(),
            body,
        }
    }

    fn chunk_lengths(frames: &[WireFrame]) -> Vec<usize> {
        frames.iter()
            .filter_map(|f| match f {
                WireFrame::Binary(b) => Some(ChunkFrame::decode(b).unwrap().1.len()),
                WireFrame::Text(_) => None,
            })
            .collect()
    }

    #[rstest]
    #[case::empty(0, 4, vec![])]
    #[case::shorter_than_slice(3, 4, vec![3])]
    #[case::exact_slice(4, 4, vec![4])]
    #[case::exact_multiple(12, 4, vec![4, 4, 4])]
    #[case::remainder(13, 4, vec![4, 4, 4, 1])]
    #[case::slice_of_one(3, 1, vec![1, 1, 1])]
    fn test_chunk_lengths(#[case] len: usize, #[case] slice_size: usize, #[case] expected: Vec<usize>) {
        let frames = message(vec![7u8; len]).encode_frames(slice_size);
        assert_eq!(chunk_lengths(&frames), expected);
        assert_eq!(frames.len(), 2 + 2 * expected.len());
    }

    #[test]
    fn test_frame_sequence() {
        let frames = message(b"abcdefg".to_vec()).encode_frames(4);

        assert_eq!(frames, vec![
            WireFrame::Text("msg|AbCd-_12|content-length=7|action-return|none|iid-1".to_string()),
            WireFrame::Text("msg|AbCd-_12|chunk-range=0-4".to_string()),
            WireFrame::Binary(b"\x86\x01\xb0\x9d\xfb\xfd\x76abcd".to_vec()),
            WireFrame::Text("msg|AbCd-_12|chunk-range=4-7".to_string()),
            WireFrame::Binary(b"\x86\x01\xb0\x9d\xfb\xfd\x76efg".to_vec()),
            WireFrame::Text("msg|AbCd-_12|end".to_string()),
        ]);
    }

    #[test]
    fn test_ack_frame() {
        let frame = ack_frame(MessageId::parse("m1").unwrap(), "iid-7", false);
        assert_eq!(frame, WireFrame::Text("msg|m1|content-length=0|action-ack|none|iid-7|false".to_string()));
    }
}
