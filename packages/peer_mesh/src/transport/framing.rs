//! Length-prefixed JSON frames over byte streams.
//!
//! Wire format: `[4-byte big-endian length][JSON payload]`
//!
//! The first frame on every TCP connection is a [`Handshake`]; every frame
//! after that is one [`Envelope`](crate::envelope::Envelope).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;
use crate::identity::{Metadata, PeerIdentity};

/// Protocol tag carried in the handshake. Peers speaking anything else are
/// turned away before they reach the host.
pub const PROTOCOL: &str = "peer-mesh/1";

/// First frame sent by a dialing client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "M: Metadata")]
pub struct Handshake<M> {
    pub protocol: String,
    pub peer: PeerIdentity<M>,
}

impl<M: Metadata> Handshake<M> {
    pub fn new(peer: PeerIdentity<M>) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            peer,
        }
    }
}

/// Serialize `value` and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T, max: usize) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > max {
        return Err(TransportError::FrameTooLarge {
            size: bytes.len(),
            max,
        });
    }
    let len = (bytes.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one raw frame.
///
/// Returns `None` if the stream ended cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(TransportError::FrameTooLarge { size: len, max });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::identity::PeerId;
    use serde_json::json;

    #[tokio::test]
    async fn frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let env = Envelope::new("honk", json!({"loud": true}), PeerId::from("p"));

        write_frame(&mut a, &env, 1024).await.unwrap();
        let bytes = read_frame(&mut b, 1024).await.unwrap().unwrap();
        let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected_on_write() {
        let (mut a, _b) = tokio::io::duplex(64);
        let big = "x".repeat(100);
        let err = write_frame(&mut a, &big, 16).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { max: 16, .. }));
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected_on_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::FrameTooLarge {
                size: 1_000_000,
                max: 1024
            }
        ));
    }

    #[test]
    fn handshake_carries_protocol_tag() {
        let hs = Handshake::new(PeerIdentity::new(PeerId::from("c"), json!(null)));
        let wire = serde_json::to_value(&hs).unwrap();
        assert_eq!(wire["protocol"], PROTOCOL);
        assert_eq!(wire["peer"]["uuid"], "c");
    }
}
