//! Shared helpers for protocol-level tests: a scripted peer speaking the
//! frame protocol over an in-memory duplex stream.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use ssh_bridge::frame::{Frame, FrameCodec, FrameType};

/// One end of the wire, driven explicitly by a test.
pub struct ScriptedPeer {
    framed: Framed<DuplexStream, FrameCodec>,
}

impl ScriptedPeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec),
        }
    }

    /// Receive the next frame, asserting its type.
    pub async fn expect(&mut self, frame_type: FrameType) -> Frame {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream closed while waiting for a frame")
            .expect("framing error");
        assert_eq!(
            frame.frame_type, frame_type,
            "expected {:?}, got {:?}",
            frame_type, frame.frame_type
        );
        frame
    }

    /// Receive the next frame and decode its JSON payload.
    pub async fn expect_json<T: DeserializeOwned>(&mut self, frame_type: FrameType) -> T {
        let frame = self.expect(frame_type).await;
        serde_json::from_slice(&frame.payload).expect("valid JSON payload")
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.expect("send frame");
    }

    pub async fn send_json<T: Serialize>(&mut self, frame_type: FrameType, payload: &T) {
        self.send(Frame::json(frame_type, payload).expect("encode payload"))
            .await;
    }

    /// Close this end of the stream.
    pub async fn close(mut self) {
        self.framed.close().await.expect("close stream");
    }

    /// Read until the peer closes the stream, failing on further frames
    /// arriving after `deadline`-worth of patience runs out.
    pub async fn expect_closed(mut self) {
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while let Some(frame) = self.framed.next().await {
                frame.expect("framing error before close");
            }
        })
        .await;
        assert!(outcome.is_ok(), "peer did not close the stream");
    }
}

/// An in-memory wire: (client end, scripted peer on the other end).
pub fn wire() -> (DuplexStream, ScriptedPeer) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    (near, ScriptedPeer::new(far))
}
