use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Protocol messages are tiny; anything beyond this is a malformed frame.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1_024;

#[derive(Debug, Error)]
#[error("CodecError")]
pub enum CodecError {
    StdIo(#[from] std::io::Error),
    SerDe(serde_json::Error),
}

/// Length-delimited frames carrying one serde-encoded message each. The
/// body is self-describing, so decoders skip fields they do not know.
#[derive(Debug)]
pub(crate) struct MessageCodec<M> {
    length_codec: LengthDelimitedCodec,
    _marker: PhantomData<M>,
}

impl<M> MessageCodec<M> {
    pub(crate) fn new() -> Self {
        Self {
            length_codec: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_MESSAGE_SIZE)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<M: DeserializeOwned> Decoder for MessageCodec<M> {
    type Item = M;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.length_codec.decode(src)? else {
            return Ok(None);
        };

        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(CodecError::SerDe)
    }
}

impl<M: Serialize> Encoder<&M> for MessageCodec<M> {
    type Error = CodecError;

    fn encode(&mut self, item: &M, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(item).map_err(CodecError::SerDe)?;

        self.length_codec
            .encode(Bytes::from(body), dst)
            .map_err(CodecError::StdIo)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use tokio_test::io::Builder;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::wire::{PushRequest, PushResponse};

    #[test]
    fn frame_round_trip() {
        let request = PushRequest::new("notes.txt", 42, vec![1, 2, 3]);
        let response = PushResponse::new(true);

        let mut buffer = BytesMut::new();

        let mut codec = MessageCodec::<PushRequest>::new();
        codec.encode(&request, &mut buffer).unwrap();
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded.filename, request.filename);
        assert_eq!(decoded.size, request.size);
        assert_eq!(decoded.cid, request.cid);

        let mut codec = MessageCodec::<PushResponse>::new();
        codec.encode(&response, &mut buffer).unwrap();
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert!(decoded.accept);
    }

    #[tokio::test]
    async fn frames_from_stream() {
        let first = PushRequest::new("a.txt", 1, vec![0xaa]);
        let second = PushRequest::new("b.txt", 2, vec![0xbb]);

        let mut buffer = BytesMut::new();
        let mut codec = MessageCodec::<PushRequest>::new();
        codec.encode(&first, &mut buffer).unwrap();
        codec.encode(&second, &mut buffer).unwrap();

        let mut stream = Builder::new().read(&buffer.freeze()).build();
        let mut framed = FramedRead::new(&mut stream, MessageCodec::<PushRequest>::new());

        let decoded = framed.next().await.unwrap().unwrap();
        assert_eq!(decoded.filename, "a.txt");

        let decoded = framed.next().await.unwrap().unwrap();
        assert_eq!(decoded.filename, "b.txt");

        assert!(framed.next().await.is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let request = PushRequest::new("big", 0, vec![0_u8; MAX_MESSAGE_SIZE]);

        let mut buffer = BytesMut::new();
        let mut codec = MessageCodec::<PushRequest>::new();
        assert!(codec.encode(&request, &mut buffer).is_err());
    }
}
