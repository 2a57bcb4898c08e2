//! Length-prefixed framing.
//!
//! Peer streams: `[unsigned LEB128 length][payload]`.
//! HTTP response bodies: `[u16 LE length][payload]`.

use super::{PeerStream, TransportError};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const MAX_VARINT_LEN: usize = 10;

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Write one frame. Prefix and payload go out in a single write.
pub async fn write_frame<S: PeerStream + ?Sized>(stream: &mut S, payload: &[u8]) -> Result<(), TransportError> {
    let mut buf = Vec::with_capacity(payload.len() + MAX_VARINT_LEN);
    encode_varint(payload.len() as u64, &mut buf);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await
}

/// Read one frame. Returns `Ok(None)` if the stream ended cleanly before a new
/// frame started.
pub async fn read_frame<S: PeerStream + ?Sized>(
    stream: &mut S,
    max_size: usize,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut len: u64 = 0;
    let mut byte = [0u8; 1];
    for i in 0..MAX_VARINT_LEN {
        match stream.read_exact(&mut byte).await {
            Ok(()) => {}
            Err(TransportError::Closed) if i == 0 => return Ok(None),
            Err(e) => return Err(e),
        }
        len |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 == 0 {
            let len = usize::try_from(len).unwrap_or(usize::MAX);
            if len > max_size {
                return Err(TransportError::FrameTooLarge { len, max: max_size });
            }
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            return Ok(Some(buf));
        }
    }
    Err(TransportError::MalformedPrefix)
}

// --- HTTP frames ---

pub fn encode_http_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let len = u16::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        len: payload.len(),
        max: u16::MAX as usize,
    })?;
    let mut buf = Vec::with_capacity(payload.len() + 2);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Incremental decoder for HTTP frames arriving in arbitrary chunks.
#[derive(Debug, Default)]
pub struct HttpFrameDecoder {
    buf: Vec<u8>,
}

impl HttpFrameDecoder {
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let frame = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        Some(frame)
    }

    /// Bytes of an incomplete frame still waiting for the rest.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryStream;

    #[test]
    fn varint_encoding() {
        let mut buf = Vec::new();
        encode_varint(1, &mut buf);
        assert_eq!(buf, [0x01]);
        buf.clear();
        encode_varint(300, &mut buf);
        assert_eq!(buf, [0xac, 0x02]);
        buf.clear();
        encode_varint(u64::MAX, &mut buf);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
    }

    #[tokio::test]
    async fn frames_in_sequence() {
        let (mut a, mut b) = MemoryStream::pair();
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, &vec![7u8; 1000]).await.unwrap();
        write_frame(&mut a, b"").await.unwrap();

        assert_eq!(read_frame(&mut b, 4096).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b, 4096).await.unwrap().unwrap(), vec![7u8; 1000]);
        assert_eq!(read_frame(&mut b, 4096).await.unwrap().unwrap(), b"");
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (mut a, mut b) = MemoryStream::pair();
        write_frame(&mut a, b"last").await.unwrap();
        a.close().await.unwrap();
        assert!(read_frame(&mut b, 64).await.unwrap().is_some());
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, mut b) = MemoryStream::pair();
        a.write_all(&[10, b'x', b'y']).await.unwrap();
        a.close().await.unwrap();
        assert!(matches!(read_frame(&mut b, 64).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = MemoryStream::pair();
        write_frame(&mut a, &[0u8; 100]).await.unwrap();
        match read_frame(&mut b, 50).await {
            Err(TransportError::FrameTooLarge { len, max }) => {
                assert_eq!(len, 100);
                assert_eq!(max, 50);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlong_prefix_rejected() {
        let (mut a, mut b) = MemoryStream::pair();
        a.write_all(&[0xff; 11]).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, 64).await,
            Err(TransportError::MalformedPrefix)
        ));
    }

    #[test]
    fn http_frames_decode_across_chunks() {
        let mut body = encode_http_frame(b"one").unwrap();
        body.extend(encode_http_frame(b"second").unwrap());

        let mut decoder = HttpFrameDecoder::default();
        let mut frames = Vec::new();
        for chunk in body.chunks(2) {
            decoder.extend(chunk);
            while let Some(frame) = decoder.next_frame() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![b"one".to_vec(), b"second".to_vec()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn http_prefix_is_little_endian() {
        let frame = encode_http_frame(&[0u8; 258]).unwrap();
        assert_eq!(&frame[..2], &[0x02, 0x01]);
    }

    #[test]
    fn http_frame_limit() {
        assert!(encode_http_frame(&vec![0u8; u16::MAX as usize]).is_ok());
        assert!(matches!(
            encode_http_frame(&vec![0u8; u16::MAX as usize + 1]),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }
}
