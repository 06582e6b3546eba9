use futures_util::{SinkExt, StreamExt};
use relay_protocol::{types, Envelope};
use serde_json::{json, Map, Value};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A scripted tabletop instance: connects to `/relay`, joins with a hello,
/// and sends/receives envelopes on demand.  Control frames are skipped on
/// receive; not calling `recv_envelope` at all simulates a stalled client
/// (no pongs ever go back).
pub struct MockTableClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockTableClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connect and complete the join handshake; returns after the `joined`
    /// acknowledgement arrives.
    pub async fn join(
        url: &str,
        client_id: &str,
        api_key: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut client = Self::connect(url).await?;
        let mut hello = Envelope::new(types::HELLO);
        hello.insert("clientId", json!(client_id));
        hello.insert("apiKey", json!(api_key));
        hello.insert("metadata", json!({ "origin": "mock://test" }));
        client.send_envelope(&hello).await?;
        let ack = client.recv_envelope().await?;
        if ack.message_type != types::JOINED {
            return Err(format!("expected joined ack, got {:?}", ack).into());
        }
        Ok(client)
    }

    pub async fn send_envelope(
        &mut self,
        envelope: &Envelope,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(envelope)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send a reply to a previously received command, echoing its requestId.
    pub async fn reply(
        &mut self,
        request_id: &str,
        message_type: &str,
        payload: Map<String, Value>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let envelope = Envelope::new(message_type)
            .with_request_id(request_id)
            .with_payload(payload);
        self.send_envelope(&envelope).await
    }

    pub async fn recv_envelope(&mut self) -> Result<Envelope, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope: Envelope = serde_json::from_str(&text)?;
                    return Ok(envelope);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Receive until an envelope of `message_type` arrives, discarding others.
    pub async fn recv_until(
        &mut self,
        message_type: &str,
    ) -> Result<Envelope, Box<dyn std::error::Error>> {
        loop {
            let envelope = self.recv_envelope().await?;
            if envelope.message_type == message_type {
                return Ok(envelope);
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
