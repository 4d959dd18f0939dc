//! Serialized write path onto the shared transport

use std::sync::Arc;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use bf_protocol::{FrameCodec, Message, ProtocolError};

/// Cloneable handle writing whole frames onto the transport.
///
/// Each `send` holds the lock from encoding through flush, so frames from
/// concurrently completing requests never interleave.
pub struct FrameWriter<W> {
    inner: Arc<Mutex<FramedWrite<W, FrameCodec>>>,
}

impl<W> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap the write half of a transport
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FramedWrite::new(writer, FrameCodec::new()))),
        }
    }

    /// Write one message as a single frame and flush it
    pub async fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        let mut sink = self.inner.lock().await;
        sink.send(message).await
    }

    /// Flush and shut down the write side
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let mut sink = self.inner.lock().await;
        SinkExt::<&Message>::close(&mut *sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_protocol::{HttpResponse, Headers, RequestId};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (client, mut server) = tokio::io::duplex(64);
        let writer = FrameWriter::new(client);

        let mut handles = Vec::new();
        for i in 0..20 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                let body = format!("{}", i).repeat(200);
                let response = HttpResponse::new(RequestId::new(format!("r{}", i)), 200, Headers::new(), body);
                writer.send(&Message::HttpResponse(response)).await.unwrap();
            }));
        }

        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            server.read_to_end(&mut out).await.unwrap();
            out
        });

        for handle in handles {
            handle.await.unwrap();
        }
        writer.close().await.unwrap();
        drop(writer);

        let bytes = reader.await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut ids: Vec<String> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["requestId"].as_str().unwrap().to_string()
            })
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }
}
