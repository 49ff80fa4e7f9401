use serde::{Deserialize, Serialize};
use crate::types::{RequestId, SceneContext, TranscriptionMethod};

/// Messages sent by the host-application client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Configure {
        model: String,
        method: TranscriptionMethod,
    },
    ContextResponse {
        request_id: RequestId,
        #[serde(default)]
        context: SceneContext,
    },
    ProcessText {
        text: String,
        #[serde(default)]
        context: SceneContext,
    },
    ExecutionError {
        request_id: RequestId,
        error_type: String,
        error_message: String,
    },
}

/// Messages sent by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DaemonMessage {
    Ready {
        message: String,
    },
    Info {
        message: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_text: Option<String>,
    },
    Stopped {
        message: String,
    },
    RequestContext {
        request_id: RequestId,
        message: String,
    },
    Script {
        request_id: RequestId,
        script: String,
        original_text: Option<String>,
        message: String,
    },
}

impl DaemonMessage {
    pub fn info(message: impl Into<String>) -> Self {
        DaemonMessage::Info { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        DaemonMessage::Error {
            message: message.into(),
            request_id: None,
            original_text: None,
        }
    }

    pub fn request_error(
        request_id: RequestId,
        message: impl Into<String>,
        original_text: Option<String>,
    ) -> Self {
        DaemonMessage::Error {
            message: message.into(),
            request_id: Some(request_id),
            original_text,
        }
    }

    /// Request id carried by the message, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            DaemonMessage::RequestContext { request_id, .. }
            | DaemonMessage::Script { request_id, .. } => Some(request_id),
            DaemonMessage::Error { request_id, .. } => request_id.as_ref(),
            _ => None,
        }
    }

    /// `script` and request-scoped `error` messages end a request.
    pub fn is_terminal(&self) -> bool {
        match self {
            DaemonMessage::Script { .. } => true,
            DaemonMessage::Error { request_id, .. } => request_id.is_some(),
            _ => false,
        }
    }
}

pub mod protocol {
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use serde_json::Deserializer;
    use thiserror::Error;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
    const READ_CHUNK: usize = 8192;

    #[derive(Debug, Error)]
    pub enum FrameError {
        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),

        #[error("malformed message: {0}")]
        Malformed(String),

        #[error("message exceeds {limit} bytes without completing")]
        TooLarge { limit: usize },

        #[error("encode error: {0}")]
        Encode(#[from] serde_json::Error),
    }

    /// Receive buffer that yields one complete JSON value at a time.
    ///
    /// Bytes past the end of the first complete value are retained for the
    /// next call, so a read carrying several messages, or half of one, is
    /// handled without losing data.
    #[derive(Debug)]
    pub struct MessageBuffer {
        buf: Vec<u8>,
        max_frame_bytes: usize,
    }

    impl Default for MessageBuffer {
        fn default() -> Self {
            Self::new(DEFAULT_MAX_FRAME_BYTES)
        }
    }

    impl MessageBuffer {
        pub fn new(max_frame_bytes: usize) -> Self {
            Self {
                buf: Vec::new(),
                max_frame_bytes,
            }
        }

        pub fn extend(&mut self, bytes: &[u8]) {
            self.buf.extend_from_slice(bytes);
        }

        #[cfg(test)]
        fn is_empty(&self) -> bool {
            self.buf.is_empty()
        }

        /// Pop the next complete message.
        ///
        /// `Ok(None)` means more bytes are needed. On `Err` the buffered bytes
        /// are dropped, since the stream position can no longer be trusted.
        pub fn next_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
            let leading = self
                .buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if leading > 0 {
                self.buf.drain(..leading);
            }
            if self.buf.is_empty() {
                return Ok(None);
            }

            let (parsed, consumed) = {
                let mut stream = Deserializer::from_slice(&self.buf).into_iter::<T>();
                let parsed = stream.next();
                (parsed, stream.byte_offset())
            };
            match parsed {
                Some(Ok(message)) => {
                    self.buf.drain(..consumed);
                    Ok(Some(message))
                }
                Some(Err(e)) if e.is_eof() => {
                    if self.buf.len() > self.max_frame_bytes {
                        let limit = self.max_frame_bytes;
                        self.buf.clear();
                        return Err(FrameError::TooLarge { limit });
                    }
                    Ok(None)
                }
                Some(Err(e)) => {
                    self.buf.clear();
                    Err(FrameError::Malformed(e.to_string()))
                }
                None => Ok(None),
            }
        }
    }

    pub async fn send_message<W, T>(stream: &mut W, message: &T) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let mut serialized = serde_json::to_vec(message)?;
        serialized.push(b'\n');

        stream.write_all(&serialized).await?;
        stream.flush().await?;

        Ok(())
    }

    /// Read until one complete message is buffered.
    ///
    /// Returns `Ok(None)` when the peer closes the stream.
    pub async fn receive_message<R, T>(
        stream: &mut R,
        buffer: &mut MessageBuffer,
    ) -> Result<Option<T>, FrameError>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(message) = buffer.next_message()? {
                return Ok(Some(message));
            }

            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            buffer.extend(&chunk[..n]);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::ipc::{ClientMessage, DaemonMessage};
        use crate::types::{RequestId, SceneContext, TranscriptionMethod};
        use serde_json::{json, Value};

        fn sample_messages() -> Vec<ClientMessage> {
            vec![
                ClientMessage::Configure {
                    model: "gemini-1.5-flash".into(),
                    method: TranscriptionMethod::Whisper,
                },
                ClientMessage::ProcessText {
                    text: "add a cube named \"Box {1}\"".into(),
                    context: SceneContext(json!({"mode": "OBJECT", "scene_objects": ["A", "B"]})),
                },
                ClientMessage::ExecutionError {
                    request_id: RequestId::from("r-1"),
                    error_type: "AttributeError".into(),
                    error_message: "'NoneType' object has no attribute 'select_set'".into(),
                },
            ]
        }

        fn encoded(messages: &[ClientMessage]) -> Vec<u8> {
            let mut bytes = Vec::new();
            for m in messages {
                bytes.extend(serde_json::to_vec(m).unwrap());
                bytes.push(b'\n');
            }
            bytes
        }

        #[test]
        fn reassembles_messages_from_any_chunk_size() {
            let messages = sample_messages();
            let bytes = encoded(&messages);

            for chunk_size in 1..=bytes.len() {
                let mut buffer = MessageBuffer::default();
                let mut decoded = Vec::new();
                for chunk in bytes.chunks(chunk_size) {
                    buffer.extend(chunk);
                    while let Some(message) = buffer.next_message::<ClientMessage>().unwrap() {
                        decoded.push(message);
                    }
                }
                assert_eq!(decoded, messages, "chunk size {}", chunk_size);
                assert!(buffer.is_empty());
            }
        }

        #[test]
        fn handles_back_to_back_objects_without_separator() {
            let mut buffer = MessageBuffer::default();
            buffer.extend(br#"{"a":1}{"b":2}{"c""#);

            assert_eq!(buffer.next_message::<Value>().unwrap(), Some(json!({"a": 1})));
            assert_eq!(buffer.next_message::<Value>().unwrap(), Some(json!({"b": 2})));
            assert_eq!(buffer.next_message::<Value>().unwrap(), None);

            buffer.extend(br#":3}"#);
            assert_eq!(buffer.next_message::<Value>().unwrap(), Some(json!({"c": 3})));
        }

        #[test]
        fn incomplete_input_is_not_an_error() {
            let mut buffer = MessageBuffer::default();
            buffer.extend(br#"{"type":"process_text","text":"hel"#);
            assert!(buffer.next_message::<Value>().unwrap().is_none());
            assert!(!buffer.is_empty());
        }

        #[test]
        fn garbage_is_a_protocol_error_and_resets_the_buffer() {
            let mut buffer = MessageBuffer::default();
            buffer.extend(b"}{not json");
            let err = buffer.next_message::<Value>().unwrap_err();
            assert!(matches!(err, FrameError::Malformed(_)));
            assert!(buffer.is_empty());

            buffer.extend(br#"{"ok":true}"#);
            assert_eq!(buffer.next_message::<Value>().unwrap(), Some(json!({"ok": true})));
        }

        #[test]
        fn oversized_partial_frame_is_rejected() {
            let mut buffer = MessageBuffer::new(16);
            buffer.extend(br#"{"text":"aaaaaaaaaaaaaaaaaaaa"#);
            assert!(matches!(
                buffer.next_message::<Value>(),
                Err(FrameError::TooLarge { limit: 16 })
            ));
        }

        #[test]
        fn daemon_messages_use_status_discriminator() {
            let message = DaemonMessage::Script {
                request_id: RequestId::from("abc"),
                script: "import bpy".into(),
                original_text: Some("select the cube".into()),
                message: "Generated script".into(),
            };
            let value = serde_json::to_value(&message).unwrap();
            assert_eq!(value["status"], "script");
            assert_eq!(value["request_id"], "abc");
            assert_eq!(value["original_text"], "select the cube");

            let plain = serde_json::to_value(DaemonMessage::error("nope")).unwrap();
            assert_eq!(plain, json!({"status": "error", "message": "nope"}));
        }

        #[tokio::test]
        async fn receive_reports_orderly_close() {
            let (mut client, mut server) = tokio::io::duplex(64);
            send_message(&mut client, &json!({"type": "configure"})).await.unwrap();
            drop(client);

            let mut buffer = MessageBuffer::default();
            let first: Option<Value> = receive_message(&mut server, &mut buffer).await.unwrap();
            assert_eq!(first, Some(json!({"type": "configure"})));
            let second: Option<Value> = receive_message(&mut server, &mut buffer).await.unwrap();
            assert!(second.is_none());
        }
    }
}
