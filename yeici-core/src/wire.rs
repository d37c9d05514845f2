//! Distribution framing: one compact JSON object per processed frame, terminated by `\n`.

use crate::transform::ProcessedFrame;

const DELIMITER: u8 = b'\n';
const MAX_LINE_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Encode a processed frame as a single JSON line (object + `\n`).
pub fn encode_line(frame: &ProcessedFrame) -> Result<Vec<u8>, LineEncodeError> {
    let mut out = serde_json::to_vec(frame).map_err(LineEncodeError::Encode)?;
    if out.len() > MAX_LINE_LEN {
        return Err(LineEncodeError::TooLarge);
    }
    out.push(DELIMITER);
    Ok(out)
}

/// Error encoding a frame into a line (serde_json or size limit).
#[derive(Debug, thiserror::Error)]
pub enum LineEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("line too large")]
    TooLarge,
}

/// Decode one line from the front of `bytes`. Returns the frame and the number of bytes
/// consumed, delimiter included. A buffer with no delimiter yet is `NeedMore`.
pub fn decode_line(bytes: &[u8]) -> Result<(ProcessedFrame, usize), LineDecodeError> {
    let end = match bytes.iter().position(|&b| b == DELIMITER) {
        Some(end) => end,
        None if bytes.len() > MAX_LINE_LEN => return Err(LineDecodeError::TooLarge),
        None => return Err(LineDecodeError::NeedMore),
    };
    if end > MAX_LINE_LEN {
        return Err(LineDecodeError::TooLarge);
    }
    let frame: ProcessedFrame =
        serde_json::from_slice(&bytes[..end]).map_err(LineDecodeError::Decode)?;
    Ok((frame, end + 1))
}

/// Error decoding a line (need more bytes, too large, or serde_json failure).
#[derive(Debug, thiserror::Error)]
pub enum LineDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("line too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DecodedFrame, RigidBody, Skeleton};
    use crate::natnet::{self, Packet};
    use crate::transform::{MocapTransformer, Subject};

    fn rb9_frame(frame_number: u32) -> DecodedFrame {
        DecodedFrame {
            frame_number,
            rigid_bodies: vec![RigidBody::new(9, [0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0])],
            skeletons: vec![],
        }
    }

    #[test]
    fn datagram_to_json_line() {
        let datagram = natnet::encode_frame_of_data(&rb9_frame(812));
        let decoded = match natnet::decode(&datagram).unwrap() {
            Packet::FrameOfData(f) => f,
            other => panic!("expected frame, got {:?}", other),
        };
        let processed = MocapTransformer::new().process(&decoded);
        let line = encode_line(&processed).unwrap();
        assert_eq!(
            String::from_utf8(line).unwrap(),
            concat!(
                r#"{"frame_number":812,"subjects":{"RB_9":{"#,
                r#""unreal":{"pos":[0.0,0.0,100.0],"rot":[0.0,0.0,0.0,-1.0]},"#,
                r#""maya":{"pos":[0.0,100.0,0.0],"rot":[0.0,0.0,0.0,1.0]}}}}"#,
                "\n"
            )
        );
    }

    #[test]
    fn stale_flag_only_on_wire_when_set() {
        let mut t = MocapTransformer::new();
        let mut frame = rb9_frame(1);
        frame.rigid_bodies[0].position[1] = f32::NAN;
        let line = String::from_utf8(encode_line(&t.process(&frame)).unwrap()).unwrap();
        assert!(line.contains(r#""stale":true"#));
        let clean = String::from_utf8(encode_line(&t.process(&rb9_frame(2))).unwrap()).unwrap();
        assert!(!clean.contains("stale"));
    }

    #[test]
    fn consumer_splits_concatenated_lines() {
        let mut t = MocapTransformer::new();
        let a = t.process(&rb9_frame(1));
        let b = t.process(&DecodedFrame {
            frame_number: 2,
            rigid_bodies: vec![],
            skeletons: vec![Skeleton {
                id: 1,
                bones: vec![RigidBody::new(65537, [0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0])],
            }],
        });
        let mut buf = encode_line(&a).unwrap();
        buf.extend_from_slice(&encode_line(&b).unwrap());

        let (first, n1) = decode_line(&buf).unwrap();
        assert_eq!(first, a);
        let (second, n2) = decode_line(&buf[n1..]).unwrap();
        assert_eq!(second, b);
        assert_eq!(n1 + n2, buf.len());
        assert!(matches!(
            second.subjects.get("SK_1"),
            Some(Subject::Skeleton { bone_count: 1, .. })
        ));
    }

    #[test]
    fn partial_line_need_more() {
        let line = encode_line(&MocapTransformer::new().process(&rb9_frame(5))).unwrap();
        assert!(matches!(
            decode_line(&line[..line.len() - 1]),
            Err(LineDecodeError::NeedMore)
        ));
        assert!(matches!(decode_line(b""), Err(LineDecodeError::NeedMore)));
    }

    #[test]
    fn garbage_line_is_decode_error() {
        assert!(matches!(
            decode_line(b"not json\n"),
            Err(LineDecodeError::Decode(_))
        ));
    }
}
