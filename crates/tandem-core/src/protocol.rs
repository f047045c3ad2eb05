//! Wire types and the streaming JSON codec.
//!
//! Messages are single JSON values written back to back on the stream. There
//! is no length prefix; a message ends where its JSON value ends.
//!
//! ```text
//! {"jsonrpc":"2.0","method":"arith.Add","params":[1,2],"id":7}
//! {"jsonrpc":"2.0","result":3,"id":7}
//! ```

use crate::config::ProtocolConfig;
use crate::error::{Result, TandemError};
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol error codes.
pub mod codes {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const HANDLER_RETURNED_ERROR: i32 = -32001;
    pub const HANDLER_PANICKED: i32 = -32002;
    pub const OVER_SERVER_LIMIT: i32 = -32003;
}

/// Outgoing call. Parameters are positional only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub params: Vec<Value>,
    pub id: u64,
}

/// `"params": null` is the same as no params.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Request {
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: u64) -> Self {
        Self {
            jsonrpc: ProtocolConfig::VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// Reply to a [`Request`]. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: u64,
}

impl Response {
    /// Create a success response. A `null` result is still written out.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: ProtocolConfig::VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn failure(id: u64, error: ErrorObject) -> Self {
        Self {
            jsonrpc: ProtocolConfig::VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Collapse into the caller-facing outcome.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(TandemError::Remote(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Structured error carried by a [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found").with_data(Value::from(method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// The method ran and returned its own failure.
    pub fn handler_error(message: impl Into<String>) -> Self {
        Self::new(codes::HANDLER_RETURNED_ERROR, message)
    }

    pub fn handler_panicked(message: impl Into<String>) -> Self {
        Self::new(codes::HANDLER_PANICKED, message)
    }

    pub fn over_server_limit() -> Self {
        Self::new(codes::OVER_SERVER_LIMIT, "Over Server Limit")
    }
}

fn default_version() -> String {
    ProtocolConfig::VERSION.to_string()
}

/// Tracks where the first buffered value ends without parsing it.
///
/// Scanning resumes where the previous read left off, so a large value that
/// trickles in is walked once instead of re-parsed on every chunk.
#[derive(Debug, Default)]
struct Scanner {
    pos: usize,
    depth: usize,
    started: bool,
    in_string: bool,
    escaped: bool,
    /// Top-level scalar: short, so leave it to the parser each time.
    scalar: bool,
}

impl Scanner {
    /// Whether `buf` may hold a complete value worth handing to the parser.
    fn ready(&mut self, buf: &[u8]) -> bool {
        if self.scalar {
            return true;
        }

        while self.pos < buf.len() {
            let byte = buf[self.pos];
            self.pos += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return true;
                    }
                }
                continue;
            }

            match byte {
                b'"' => {
                    self.started = true;
                    self.in_string = true;
                }
                b'{' | b'[' => {
                    self.started = true;
                    self.depth += 1;
                }
                b'}' | b']' => {
                    // A stray closer is malformed; let the parser report it.
                    if self.depth <= 1 {
                        return true;
                    }
                    self.depth -= 1;
                }
                _ if byte.is_ascii_whitespace() => {}
                _ if !self.started => {
                    self.scalar = true;
                    return true;
                }
                _ => {}
            }
        }

        false
    }
}

/// Decodes consecutive JSON values from a byte stream.
///
/// Bytes read past the end of one value stay buffered for the next call, so a
/// single read may yield several messages and a message may span many reads.
pub struct MessageReader<R> {
    reader: R,
    buf: BytesMut,
    scanner: Scanner,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(ProtocolConfig::READ_CHUNK_SIZE),
            scanner: Scanner::default(),
        }
    }

    /// Read the next value.
    ///
    /// Returns `None` on a clean EOF between values. EOF in the middle of a
    /// value is reported as an `UnexpectedEof` transport error.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if self.scanner.ready(&self.buf) {
                if let Some(value) = self.try_decode()? {
                    self.scanner = Scanner::default();
                    return Ok(Some(value));
                }
            }

            if self.buf.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
                return Err(TandemError::Codec {
                    message: format!(
                        "message exceeds maximum size of {} bytes",
                        ProtocolConfig::MAX_MESSAGE_SIZE
                    ),
                });
            }

            self.buf.reserve(ProtocolConfig::READ_CHUNK_SIZE);
            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                return if self.buf.iter().all(u8::is_ascii_whitespace) {
                    Ok(None)
                } else {
                    Err(TandemError::Transport {
                        kind: ErrorKind::UnexpectedEof,
                        message: "stream closed in the middle of a message".to_string(),
                    })
                };
            }
        }
    }

    fn try_decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<T>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            // Incomplete value: wait for more bytes.
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(TandemError::Codec {
                message: e.to_string(),
            }),
            // Only whitespace buffered so far.
            None => Ok(None),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Encode `value` as one message: its JSON followed by a newline.
pub fn encode_message<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value).map_err(|e| TandemError::Codec {
        message: e.to_string(),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Serialize `value` and write it as one message.
///
/// Serialization happens before any byte is written, so a value that cannot
/// be encoded fails with a codec error and leaves the stream untouched.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = encode_message(value)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = Request::new("halo.Add", vec![json!(42), json!(23)], 1);
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"jsonrpc":"2.0","method":"halo.Add","params":[42,23],"id":1}"#
        );
    }

    #[test]
    fn test_request_without_params_decodes() {
        let request: Request = serde_json::from_str(r#"{"method":"a.b","id":9}"#).unwrap();
        assert_eq!(request.jsonrpc, "2.0");
        assert!(request.params.is_empty());
        assert_eq!(request.id, 9);
    }

    #[test]
    fn test_null_params_decode_as_empty() {
        let request: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"a.b","params":null,"id":2}"#).unwrap();
        assert!(request.params.is_empty());
        assert_eq!(request.id, 2);
    }

    #[test]
    fn test_scanner_waits_for_closing_brace() {
        let message = br#"{"s":"a}\"{b","n":[1,{"k":2}]}"#;
        let mut scanner = Scanner::default();
        for end in 1..message.len() {
            assert!(!scanner.ready(&message[..end]), "ready early at {}", end);
        }
        assert!(scanner.ready(message));
    }

    #[test]
    fn test_null_result_is_written() {
        let json = serde_json::to_string(&Response::success(3, Value::Null)).unwrap();
        assert_eq!(json, r#"{"jsonrpc":"2.0","result":null,"id":3}"#);
    }

    #[test]
    fn test_error_response_serialization() {
        let resp = Response::failure(5, ErrorObject::over_server_limit());
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"jsonrpc":"2.0","error":{"code":-32003,"message":"Over Server Limit"},"id":5}"#
        );
    }

    #[test]
    fn test_into_result() {
        let ok: Response = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert_eq!(ok.into_result().unwrap(), Value::Null);

        let err = Response::failure(1, ErrorObject::handler_error("no such user"));
        match err.into_result() {
            Err(TandemError::Remote(obj)) => {
                assert_eq!(obj.code, codes::HANDLER_RETURNED_ERROR);
                assert_eq!(obj.message, "no such user");
            }
            other => panic!("Expected remote error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reader_decodes_back_to_back_values() {
        let input: &[u8] = b"{\"jsonrpc\":\"2.0\",\"result\":1,\"id\":1}{\"jsonrpc\":\"2.0\",\"result\":2,\"id\":2}\n\n";
        let mut reader = MessageReader::new(input);

        let first: Response = reader.next().await.unwrap().unwrap();
        let second: Response = reader.next().await.unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.result, Some(json!(2)));
        assert!(reader.next::<Response>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_handles_split_writes() {
        let (client, mut server) = tokio::io::duplex(64);
        let message = serde_json::to_vec(&Request::new("svc.m", vec![json!("x".repeat(200))], 4)).unwrap();

        let writer = tokio::spawn(async move {
            for chunk in message.chunks(7) {
                server.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = MessageReader::new(client);
        let request: Request = reader.next().await.unwrap().unwrap();
        assert_eq!(request.id, 4);
        assert_eq!(request.params[0].as_str().unwrap().len(), 200);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_handles_braces_inside_strings_split_bytewise() {
        let (client, mut server) = tokio::io::duplex(16);
        let first = serde_json::to_vec(&Request::new("svc.m", vec![json!("}{\"]")], 1)).unwrap();
        let second = serde_json::to_vec(&Request::new("svc.n", vec![], 2)).unwrap();

        let writer = tokio::spawn(async move {
            for byte in first.iter().chain(second.iter()) {
                server.write_all(std::slice::from_ref(byte)).await.unwrap();
            }
        });

        let mut reader = MessageReader::new(client);
        let request: Request = reader.next().await.unwrap().unwrap();
        assert_eq!(request.params, vec![json!("}{\"]")]);
        let request: Request = reader.next().await.unwrap().unwrap();
        assert_eq!(request.method, "svc.n");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_eof_mid_value_is_transport_error() {
        let input: &[u8] = b"{\"jsonrpc\":\"2.0\",\"id\":";
        let mut reader = MessageReader::new(input);
        let err = reader.next::<Response>().await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_reader_rejects_malformed_json() {
        let input: &[u8] = b"{\"id\": nope}";
        let mut reader = MessageReader::new(input);
        let err = reader.next::<Response>().await.unwrap_err();
        assert!(matches!(err, TandemError::Codec { .. }));
    }

    #[tokio::test]
    async fn test_write_message_appends_newline() {
        let mut out = Vec::new();
        write_message(&mut out, &Response::success(1, json!(true)))
            .await
            .unwrap();
        assert_eq!(out.last(), Some(&b'\n'));

        let mut reader = MessageReader::new(out.as_slice());
        let back: Response = reader.next().await.unwrap().unwrap();
        assert_eq!(back.result, Some(json!(true)));
    }
}
