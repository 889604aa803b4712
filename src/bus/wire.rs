use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BusError, BusResult};

pub(super) const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(super) enum Frame {
    Sub { subject: String },
    Unsub { subject: String },
    Pub { subject: String, payload: Value },
    Msg { subject: String, payload: Value },
    Ping,
    Pong,
}

pub(super) async fn read_frame<R>(reader: &mut R) -> BusResult<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(256);
    let bytes = reader
        .read_until(b'\n', &mut buffer)
        .await
        .map_err(|source| BusError::Io {
            context: "read frame",
            source,
        })?;
    if bytes == 0 {
        return Err(BusError::ConnectionClosed);
    }
    if buffer.len() > MAX_FRAME_BYTES {
        return Err(BusError::FrameTooLarge {
            max_bytes: MAX_FRAME_BYTES,
        });
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }
    }
    let line = std::str::from_utf8(&buffer)
        .map_err(|source| BusError::FrameInvalidUtf8 { source })?;
    serde_json::from_str::<Frame>(line).map_err(|source| BusError::Deserialize {
        context: "decode frame",
        source,
    })
}

pub(super) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> BusResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_string(frame).map_err(|source| BusError::Serialize {
        context: "encode frame",
        source,
    })?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|source| BusError::Io {
            context: "write frame",
            source,
        })
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut write_half) = tokio::io::split(client);
        let (read_half, _) = tokio::io::split(server);
        let mut reader = BufReader::new(read_half);

        let frame = Frame::Pub {
            subject: "armonite.telemetry".to_owned(),
            payload: serde_json::json!({"agent_id": "a-1", "requests": 12}),
        };
        write_frame(&mut write_half, &frame).await.unwrap();
        write_frame(&mut write_half, &Frame::Ping).await.unwrap();

        match read_frame(&mut reader).await.unwrap() {
            Frame::Pub { subject, payload } => {
                assert_eq!(subject, "armonite.telemetry");
                assert_eq!(payload["requests"], 12);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(matches!(read_frame(&mut reader).await.unwrap(), Frame::Ping));
    }

    #[tokio::test]
    async fn closed_pipe_reports_connection_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let (read_half, _) = tokio::io::split(server);
        let mut reader = BufReader::new(read_half);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(BusError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn garbage_line_is_a_decode_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"not json\n").await.unwrap();
        let (read_half, _) = tokio::io::split(server);
        let mut reader = BufReader::new(read_half);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(BusError::Deserialize { .. })
        ));
    }
}
