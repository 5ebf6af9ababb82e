use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Framing-level errors shared by every JSONL surface.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Read a single JSONL message from an async buffered reader.
///
/// Returns `Ok(None)` when the stream is closed (EOF).
/// Returns `Err` on malformed JSON or IO errors.
///
/// Assistant transcripts and PTY payloads make long lines routine, so no
/// line-length cap is applied here.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None); // EOF
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let msg: T = serde_json::from_str(trimmed)
        .map_err(|e| WireError::Protocol(format!("invalid JSON: {e}: {trimmed}")))?;
    Ok(Some(msg))
}

/// Write a single JSONL message to an async writer.
///
/// Serializes the message as compact JSON followed by a newline, then flushes.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json =
        serde_json::to_string(msg).map_err(|e| WireError::Protocol(format!("serialize: {e}")))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{HookMessage, HookReply};
    use crate::worker::{WorkerCall, WorkerFrame, WorkerRequest};

    #[tokio::test]
    async fn test_roundtrip_hook_message() {
        let msg = HookMessage::List;

        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let parsed: Option<HookMessage> = read_message(&mut reader).await.unwrap();
        assert!(matches!(parsed, Some(HookMessage::List)));
    }

    #[tokio::test]
    async fn test_roundtrip_worker_frame() {
        let msg = WorkerFrame::Req(WorkerRequest {
            id: 1,
            call: WorkerCall::Health,
        });

        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let parsed: Option<WorkerFrame> = read_message(&mut reader).await.unwrap();
        assert!(parsed.is_some());
    }

    #[tokio::test]
    async fn test_read_eof() {
        let buf: &[u8] = b"";
        let mut reader = tokio::io::BufReader::new(buf);
        let result: Option<HookMessage> = read_message(&mut reader).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_read_invalid_json() {
        let buf: &[u8] = b"not json\n";
        let mut reader = tokio::io::BufReader::new(buf);
        let result: Result<Option<HookMessage>, _> = read_message(&mut reader).await;
        assert!(matches!(result, Err(WireError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_long_line_is_not_truncated() {
        // A multi-megabyte line must survive intact (long assistant
        // messages are routine in transcripts).
        let long = "x".repeat(2 * 1024 * 1024);
        let reply = HookReply::err(long.clone());

        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &reply).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let parsed: HookReply = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(parsed.error.unwrap().len(), long.len());
    }

    #[tokio::test]
    async fn test_multiple_messages() {
        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &HookMessage::List).await.unwrap();
        write_message(&mut buf, &HookMessage::Status).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let first: HookMessage = read_message(&mut reader).await.unwrap().unwrap();
        assert!(matches!(first, HookMessage::List));
        let second: HookMessage = read_message(&mut reader).await.unwrap().unwrap();
        assert!(matches!(second, HookMessage::Status));
        let third: Option<HookMessage> = read_message(&mut reader).await.unwrap();
        assert!(third.is_none());
    }
}
