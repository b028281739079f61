//! Framed codec (spec §4.9, component C9): `[4-byte BE length][JSON body]`,
//! capped at 1 MiB, used on every tunnel control and data-handshake stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
	#[error("frame length {0} exceeds the 1 MiB cap")]
	TooLarge(u32),
	#[error("frame length must be positive")]
	Empty,
	#[error("frame body is not valid UTF-8: {0}")]
	InvalidUtf8(#[from] std::str::Utf8Error),
	#[error("I/O error while framing: {0}")]
	Io(#[from] std::io::Error),
}

/// A `tokio_util::codec::Decoder`/`Encoder` pair speaking the raw length
/// prefix. Kept distinct from JSON (de)serialization so callers can read the
/// body as bytes first and decide how tolerant their JSON decode should be.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
	type Item = BytesMut;
	type Error = FrameError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 4 {
			return Ok(None);
		}
		let len = u32::from_be_bytes(src[..4].try_into().unwrap());
		if len == 0 {
			return Err(FrameError::Empty);
		}
		if len > MAX_FRAME_LEN {
			return Err(FrameError::TooLarge(len));
		}
		if src.len() < 4 + len as usize {
			src.reserve(4 + len as usize - src.len());
			return Ok(None);
		}
		src.advance(4);
		Ok(Some(src.split_to(len as usize)))
	}
}

impl Encoder<&[u8]> for FrameCodec {
	type Error = FrameError;

	fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
		let len = item.len();
		if len == 0 {
			return Err(FrameError::Empty);
		}
		if len as u64 > MAX_FRAME_LEN as u64 {
			return Err(FrameError::TooLarge(len as u32));
		}
		dst.reserve(4 + len);
		dst.put_u32(len as u32);
		dst.extend_from_slice(item);
		Ok(())
	}
}

/// Reads exactly one frame directly off an `AsyncRead`, without buffering
/// past the frame boundary — used on data connections, where the first
/// frame must be consumed and the raw socket handed back untouched for
/// byte-for-byte tunneling afterward (a `Framed<_>` would over-read).
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
	let mut len_buf = [0u8; 4];
	reader.read_exact(&mut len_buf).await?;
	let len = u32::from_be_bytes(len_buf);
	if len == 0 {
		return Err(FrameError::Empty);
	}
	if len > MAX_FRAME_LEN {
		return Err(FrameError::TooLarge(len));
	}
	let mut body = vec![0u8; len as usize];
	reader.read_exact(&mut body).await?;
	Ok(body)
}

/// Writes one frame directly to an `AsyncWrite`.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), FrameError> {
	let len = body.len();
	if len == 0 {
		return Err(FrameError::Empty);
	}
	if len as u64 > MAX_FRAME_LEN as u64 {
		return Err(FrameError::TooLarge(len as u32));
	}
	writer.write_u32(len as u32).await?;
	writer.write_all(body).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn round_trips_a_frame() {
		let (mut client, mut server) = tokio::io::duplex(4096);
		write_frame(&mut client, b"{\"type\":\"heartbeat\"}").await.unwrap();
		let got = read_frame(&mut server).await.unwrap();
		assert_eq!(got, b"{\"type\":\"heartbeat\"}");
	}

	#[tokio::test]
	async fn rejects_oversized_frame() {
		let (mut client, mut server) = tokio::io::duplex(16);
		let huge = vec![0u8; (MAX_FRAME_LEN + 1) as usize];
		// Write the oversized length prefix directly; `write_frame` would
		// also reject it locally, so bypass it to exercise the reader path.
		use tokio::io::AsyncWriteExt;
		client.write_u32(huge.len() as u32).await.unwrap();
		let err = read_frame(&mut server).await.unwrap_err();
		assert!(matches!(err, FrameError::TooLarge(_)));
	}

	#[test]
	fn decoder_waits_for_full_body() {
		let mut codec = FrameCodec;
		let mut buf = BytesMut::new();
		buf.put_u32(5);
		buf.extend_from_slice(b"ab");
		assert!(codec.decode(&mut buf).unwrap().is_none());
		buf.extend_from_slice(b"cde");
		let frame = codec.decode(&mut buf).unwrap().unwrap();
		assert_eq!(&frame[..], b"abcde");
	}

	#[test]
	fn decoder_rejects_zero_length() {
		let mut codec = FrameCodec;
		let mut buf = BytesMut::new();
		buf.put_u32(0);
		assert!(matches!(codec.decode(&mut buf), Err(FrameError::Empty)));
	}
}
