//! Begin/end delimited framing.
//!
//! Wire format:
//! - `FRAME_BEGIN` (0x02)
//! - body: compact UTF-8 JSON, never containing a raw control byte
//! - `FRAME_END` (0x03)
//!
//! Bytes outside a frame are discarded. A `FRAME_BEGIN` seen inside an
//! unterminated frame restarts framing at that byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::types::{Command, WorkerResult};

pub const FRAME_BEGIN: u8 = 0x02;
pub const FRAME_END: u8 = 0x03;

/// Default upper bound for a single frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    /// Bytes after the begin delimiter already scanned for an end delimiter.
    scanned: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len, scanned: 0 }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            if self.scanned == 0 {
                match src.iter().position(|b| *b == FRAME_BEGIN) {
                    Some(start) => src.advance(start),
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            // src[0] is FRAME_BEGIN from here on
            let from = 1 + self.scanned;
            let found = src[from..]
                .iter()
                .position(|b| *b == FRAME_END || *b == FRAME_BEGIN)
                .map(|offset| from + offset);

            match found {
                Some(at) if src[at] == FRAME_END => {
                    let body_len = at - 1;
                    self.scanned = 0;
                    if body_len > self.max_frame_len {
                        src.advance(at + 1);
                        return Err(ProtocolError::FrameTooLarge {
                            size: body_len,
                            limit: self.max_frame_len,
                        });
                    }
                    let mut frame = src.split_to(at + 1);
                    frame.advance(1);
                    frame.truncate(body_len);
                    return Ok(Some(frame.freeze()));
                }
                Some(at) => {
                    // unterminated frame followed by a new one
                    src.advance(at);
                    self.scanned = 0;
                }
                None => {
                    self.scanned = src.len() - 1;
                    if self.scanned > self.max_frame_len {
                        return Err(ProtocolError::FrameTooLarge {
                            size: self.scanned,
                            limit: self.max_frame_len,
                        });
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if body.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                limit: self.max_frame_len,
            });
        }
        if let Some(at) = body.iter().position(|b| *b == FRAME_BEGIN || *b == FRAME_END) {
            return Err(ProtocolError::DelimiterInBody(at));
        }
        dst.reserve(body.len() + 2);
        dst.put_u8(FRAME_BEGIN);
        dst.put_slice(&body);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = command.encode()?;
        Encoder::<Bytes>::encode(self, body, dst)
    }
}

impl Encoder<WorkerResult> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, result: WorkerResult, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = result.encode()?;
        Encoder::<Bytes>::encode(self, body, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Blob, RunParams};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut v = vec![FRAME_BEGIN];
        v.extend_from_slice(body);
        v.push(FRAME_END);
        v
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut codec = FrameCodec::default();
        let wire = framed(br#"{"command":"best"}"#);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&wire[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[5..12]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[12..]);

        let body = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&body[..], br#"{"command":"best"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_several_frames_and_garbage() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"noise");
        buf.extend_from_slice(&framed(b"{\"a\":1}"));
        buf.extend_from_slice(b"\n\n");
        buf.extend_from_slice(&framed(b"{\"b\":2}"));

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"{\"a\":1}");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"{\"b\":2}");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unterminated_frame_is_dropped_on_new_begin() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[FRAME_BEGIN]);
        buf.extend_from_slice(b"{\"trunc");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&framed(b"{\"ok\":true}"));
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"{\"ok\":true}");
    }

    #[test]
    fn test_oversized_frame() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[FRAME_BEGIN]);
        buf.extend_from_slice(&[b'x'; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { limit: 8, .. })
        ));

        let body = Bytes::from_static(&[b'y'; 9]);
        let err = Encoder::<Bytes>::encode(&mut codec, body, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 9, .. }));
    }

    #[test]
    fn test_encoder_refuses_delimiters() {
        let mut codec = FrameCodec::default();
        let body = Bytes::from_static(b"ab\x03");
        let err = Encoder::<Bytes>::encode(&mut codec, body, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::DelimiterInBody(2)));
    }

    #[tokio::test]
    async fn test_typed_commands_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = Framed::new(a, FrameCodec::default());
        let mut rx = Framed::new(b, FrameCodec::default());

        let sent = vec![
            Command::Save("/tmp/ga.state".into()),
            Command::Restore(Blob(vec![0x02, 0x03, 0x00, 0xff])),
            Command::Run(RunParams::new(0.05, 0.9)),
            Command::Exit,
        ];
        for cmd in sent.clone() {
            tx.send(cmd).await.unwrap();
        }

        for expected in sent {
            let body = rx.next().await.unwrap().unwrap();
            assert_eq!(Command::decode(&body).unwrap(), expected);
        }
    }
}
