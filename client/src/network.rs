use log::{debug, trace};
use shared::{CodecError, Packet, PacketCodec, Schema};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),
}

/// One framed connection as seen from the game client's side.
pub struct Connection<S = TcpStream> {
    stream: S,
    outgoing: PacketCodec,
    incoming: PacketCodec,
    buffer: Vec<u8>,
}

impl Connection<TcpStream> {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", stream.peer_addr()?);
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            outgoing: PacketCodec::new(Schema::client_to_server()),
            incoming: PacketCodec::new(Schema::server_to_client()),
            buffer: vec![0; READ_BUFFER_SIZE],
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let bytes = self.outgoing.encode(packet)?;
        trace!("Sending {:?} ({} bytes)", packet.kind(), bytes.len());
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Waits for the next packet. `None` means the peer closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Packet>, ClientError> {
        loop {
            if let Some(packet) = self.incoming.next_packet()? {
                trace!("Received {:?}", packet.kind());
                return Ok(Some(packet));
            }

            let n = self.stream.read(&mut self.buffer).await?;
            if n == 0 {
                if self.incoming.buffered() > 0 {
                    debug!(
                        "Stream closed with {} undecoded bytes",
                        self.incoming.buffered()
                    );
                }
                return Ok(None);
            }
            self.incoming.feed(&self.buffer[..n]);
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::packets::{ClientChatMessage, JoinPacket, ServerChatMessage};
    use tokio_test::io::Builder;

    fn server_bytes(packet: &Packet) -> Vec<u8> {
        PacketCodec::new(Schema::server_to_client())
            .encode(packet)
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_uses_client_schema() {
        let chat = Packet::ClientChat(ClientChatMessage {
            value: "hi".to_string(),
        });
        let expected = PacketCodec::new(Schema::client_to_server())
            .encode(&chat)
            .unwrap();
        let mock = Builder::new().write(&expected).build();

        let mut connection = Connection::new(mock);
        connection.send(&chat).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_rejects_server_only_packet() {
        let mock = Builder::new().build();
        let mut connection = Connection::new(mock);

        let result = connection
            .send(&Packet::Join(JoinPacket { entity_id: 1 }))
            .await;

        assert!(matches!(
            result,
            Err(ClientError::Codec(CodecError::NotInSchema { .. }))
        ));
    }

    #[tokio::test]
    async fn test_recv_reassembles_split_packets() {
        let join = Packet::Join(JoinPacket { entity_id: 7 });
        let chat = Packet::ServerChat(ServerChatMessage {
            entity_id: 0,
            value: "welcome".to_string(),
        });
        let mut bytes = server_bytes(&join);
        bytes.extend(server_bytes(&chat));
        let (first, rest) = bytes.split_at(5);

        let mock = Builder::new().read(first).read(rest).build();
        let mut connection = Connection::new(mock);

        assert_eq!(connection.recv().await.unwrap(), Some(join));
        assert_eq!(connection.recv().await.unwrap(), Some(chat));
        assert_eq!(connection.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recv_reports_unknown_packet() {
        let mut bytes = 99u32.to_le_bytes().to_vec();
        bytes.extend(0u32.to_le_bytes());
        let mock = Builder::new().read(&bytes).build();
        let mut connection = Connection::new(mock);

        assert!(matches!(
            connection.recv().await,
            Err(ClientError::Codec(CodecError::UnknownPacket { type_id: 99 }))
        ));
    }
}
