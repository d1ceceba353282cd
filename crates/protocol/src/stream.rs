use std::io;

use futures_util::{SinkExt, StreamExt};
use libp2p::PeerId;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::auth::MessageAuthenticator;
use crate::types::ProtocolError;
use crate::wire::SignedMessage;

mod codec;

pub use codec::CodecError;
pub(crate) use codec::MessageCodec;

/// A bidirectional byte stream handed out by the transport. Besides raw
/// bytes it knows which peer sits on the other end and can be aborted.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// The peer on the remote end of the stream.
    fn remote_peer(&self) -> PeerId;

    /// Best-effort abort. Discards buffered data and severs the stream so
    /// the remote side observes the teardown rather than a clean close.
    fn reset(&mut self);
}

pub type BoxStream = Box<dyn RawStream>;

impl RawStream for BoxStream {
    fn remote_peer(&self) -> PeerId {
        (**self).remote_peer()
    }

    fn reset(&mut self) {
        (**self).reset();
    }
}

/// Signs `message` and writes it as a single frame, then closes the write
/// half of the stream while leaving the read half open.
pub async fn send<S, M>(
    auth: &MessageAuthenticator,
    stream: &mut S,
    message: &mut M,
) -> Result<(), ProtocolError>
where
    S: RawStream,
    M: SignedMessage,
{
    auth.sign(message)?;

    let mut framed = FramedWrite::new(&mut *stream, MessageCodec::<M>::new());
    if let Err(err) = framed.send(&*message).await {
        drop(framed);
        stream.reset();
        return Err(err.into());
    }
    drop(framed);

    stream.shutdown().await?;

    Ok(())
}

/// Reads a single frame from the stream, decodes it, and verifies its
/// authenticity. Any stream fault or failed verification resets the
/// stream before the error is returned.
pub async fn read<S, M>(auth: &MessageAuthenticator, stream: &mut S) -> Result<M, ProtocolError>
where
    S: RawStream,
    M: SignedMessage,
{
    let mut framed = FramedRead::new(&mut *stream, MessageCodec::<M>::new());

    let message = match framed.next().await {
        Some(Ok(message)) => message,
        Some(Err(err)) => {
            drop(framed);
            stream.reset();
            return Err(err.into());
        }
        None => {
            drop(framed);
            stream.reset();
            return Err(ProtocolError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed before a message arrived",
            )));
        }
    };
    drop(framed);

    if let Err(err) = auth.verify(&message) {
        stream.reset();
        return Err(err);
    }

    Ok(message)
}
