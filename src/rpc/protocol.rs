//! Thrift binary protocol codec
//!
//! Reads and writes the messages of the `Translate` service. All integers
//! are big-endian; strings and lists carry an i32 length prefix. Both the
//! strict (versioned) and the old-style message header are accepted on
//! read, only the strict header is written.

use std::io::{self, Read};

use super::{methods, ttype, VERSION_1, VERSION_MASK};

/// Nesting limit when skipping unknown values
const MAX_SKIP_DEPTH: usize = 64;

/// Message kind carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Call),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Exception),
            4 => Ok(MessageType::Oneway),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }
}

/// Decoded message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub kind: MessageType,
    pub seq_id: i32,
}

/// A decoded, validated call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    Translate { source: String },
    BatchTranslate { sources: Vec<String> },
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Translate { .. } => methods::TRANSLATE,
            RpcRequest::BatchTranslate { .. } => methods::BATCH_TRANSLATE,
        }
    }

    /// Number of sentences carried by the request
    pub fn sentence_count(&self) -> usize {
        match self {
            RpcRequest::Translate { .. } => 1,
            RpcRequest::BatchTranslate { sources } => sources.len(),
        }
    }
}

/// Successful result of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply {
    Translate(String),
    BatchTranslate(Vec<String>),
}

impl RpcReply {
    pub fn method(&self) -> &'static str {
        match self {
            RpcReply::Translate(_) => methods::TRANSLATE,
            RpcReply::BatchTranslate(_) => methods::BATCH_TRANSLATE,
        }
    }
}

/// `TApplicationException` type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Unknown = 0,
    UnknownMethod = 1,
    InvalidMessageType = 2,
    WrongMethodName = 3,
    BadSequenceId = 4,
    MissingResult = 5,
    InternalError = 6,
    ProtocolError = 7,
}

impl From<i32> for ExceptionKind {
    fn from(value: i32) -> Self {
        match value {
            1 => ExceptionKind::UnknownMethod,
            2 => ExceptionKind::InvalidMessageType,
            3 => ExceptionKind::WrongMethodName,
            4 => ExceptionKind::BadSequenceId,
            5 => ExceptionKind::MissingResult,
            6 => ExceptionKind::InternalError,
            7 => ExceptionKind::ProtocolError,
            _ => ExceptionKind::Unknown,
        }
    }
}

/// Protocol-level fault returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ApplicationException {
    pub kind: ExceptionKind,
    pub message: String,
}

impl ApplicationException {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::InternalError, message)
    }
}

/// Codec errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Bad protocol version: 0x{0:08X}")]
    BadVersion(u32),

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Unexpected {0:?} message")]
    UnexpectedMessage(MessageType),

    #[error("Unknown function {0}")]
    UnknownMethod(String),

    #[error("Wrong method name: expected {expected}, got {actual}")]
    WrongMethodName { expected: String, actual: String },

    #[error("Bad sequence id: expected {expected}, got {actual}")]
    BadSequenceId { expected: i32, actual: i32 },

    #[error("Negative length: {0}")]
    NegativeSize(i32),

    #[error("Payload too large: {size} > {limit}")]
    SizeLimit { size: usize, limit: usize },

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Unknown type tag: {0}")]
    UnknownType(u8),

    #[error("Unexpected type for {field}: expected {expected}, got {actual}")]
    UnexpectedType { field: &'static str, expected: u8, actual: u8 },

    #[error("Required field '{0}' is unset!")]
    MissingField(&'static str),

    #[error("{0} failed: unknown result")]
    MissingResult(String),

    #[error("Nesting too deep")]
    DepthLimit,

    #[error("Remote exception: {0}")]
    Application(ApplicationException),
}

impl ProtocolError {
    /// Stream ended before the value was complete
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// The offending message was fully consumed, so the stream is still
    /// positioned on a message boundary.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownMethod(_)
                | ProtocolError::MissingField(_)
                | ProtocolError::UnexpectedMessage(_)
        )
    }

    /// Exception sent back to the client for this error
    pub fn to_exception(&self) -> ApplicationException {
        let kind = match self {
            ProtocolError::UnknownMethod(_) => ExceptionKind::UnknownMethod,
            ProtocolError::UnexpectedMessage(_) | ProtocolError::InvalidMessageType(_) => {
                ExceptionKind::InvalidMessageType
            }
            ProtocolError::Application(exc) => return exc.clone(),
            _ => ExceptionKind::ProtocolError,
        };
        ApplicationException::new(kind, self.to_string())
    }
}

/// Binary protocol reader over any byte stream
pub struct ProtocolReader<R> {
    inner: R,
    max_bytes: usize,
}

impl<R: Read> ProtocolReader<R> {
    pub fn new(inner: R, max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    fn read_size(&mut self) -> Result<usize, ProtocolError> {
        let size = self.read_i32()?;
        if size < 0 {
            return Err(ProtocolError::NegativeSize(size));
        }
        self.check_size(size as usize)
    }

    fn check_size(&self, size: usize) -> Result<usize, ProtocolError> {
        if size > self.max_bytes {
            return Err(ProtocolError::SizeLimit { size, limit: self.max_bytes });
        }
        Ok(size)
    }

    fn read_utf8(&mut self, len: usize) -> Result<String, ProtocolError> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_size()?;
        self.read_utf8(len)
    }

    /// Read a message header, strict or old-style
    pub fn read_message_begin(&mut self) -> Result<MessageHeader, ProtocolError> {
        let word = self.read_i32()?;

        if word < 0 {
            let word = word as u32;
            let version = word & VERSION_MASK;
            if version != VERSION_1 {
                return Err(ProtocolError::BadVersion(version));
            }
            let kind = MessageType::try_from((word & 0xFF) as u8)?;
            let name = self.read_string()?;
            let seq_id = self.read_i32()?;
            Ok(MessageHeader { name, kind, seq_id })
        } else {
            // Old-style header: the first word is the name length
            let len = self.check_size(word as usize)?;
            let name = self.read_utf8(len)?;
            let kind = MessageType::try_from(self.read_byte()?)?;
            let seq_id = self.read_i32()?;
            Ok(MessageHeader { name, kind, seq_id })
        }
    }

    /// Read a field header; the id is 0 for the stop marker
    pub fn read_field_begin(&mut self) -> Result<(u8, i16), ProtocolError> {
        let field_type = self.read_byte()?;
        if field_type == ttype::STOP {
            return Ok((field_type, 0));
        }
        let id = self.read_i16()?;
        Ok((field_type, id))
    }

    pub fn read_list_begin(&mut self) -> Result<(u8, usize), ProtocolError> {
        let elem_type = self.read_byte()?;
        let size = self.read_size()?;
        Ok((elem_type, size))
    }

    /// Walk a struct, handing each field to `on_field` until the stop marker.
    /// Fields the callback does not want must be skipped by it.
    pub fn read_struct<F>(&mut self, mut on_field: F) -> Result<(), ProtocolError>
    where
        F: FnMut(&mut Self, u8, i16) -> Result<(), ProtocolError>,
    {
        loop {
            let (field_type, id) = self.read_field_begin()?;
            if field_type == ttype::STOP {
                return Ok(());
            }
            on_field(self, field_type, id)?;
        }
    }

    pub fn read_string_list(&mut self, field: &'static str) -> Result<Vec<String>, ProtocolError> {
        let (elem_type, size) = self.read_list_begin()?;
        if size > 0 && elem_type != ttype::STRING {
            return Err(ProtocolError::UnexpectedType {
                field,
                expected: ttype::STRING,
                actual: elem_type,
            });
        }
        // The byte limit covers the whole list, not each element
        let mut total = 0usize;
        let mut items = Vec::with_capacity(size.min(1024));
        for _ in 0..size {
            let len = self.read_size()?;
            total = self.check_size(total.saturating_add(len))?;
            items.push(self.read_utf8(len)?);
        }
        Ok(items)
    }

    /// Skip a value of the given wire type
    pub fn skip(&mut self, value_type: u8) -> Result<(), ProtocolError> {
        self.skip_nested(value_type, 0)
    }

    fn skip_nested(&mut self, value_type: u8, depth: usize) -> Result<(), ProtocolError> {
        if depth > MAX_SKIP_DEPTH {
            return Err(ProtocolError::DepthLimit);
        }

        match value_type {
            ttype::BOOL | ttype::BYTE => {
                self.read_byte()?;
            }
            ttype::I16 => {
                self.read_i16()?;
            }
            ttype::I32 => {
                self.read_i32()?;
            }
            ttype::I64 | ttype::DOUBLE => {
                self.read_array::<8>()?;
            }
            ttype::STRING => {
                let len = self.read_size()? as u64;
                let copied = io::copy(&mut Read::by_ref(&mut self.inner).take(len), &mut io::sink())?;
                if copied != len {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
            }
            ttype::STRUCT => loop {
                let (field_type, _) = self.read_field_begin()?;
                if field_type == ttype::STOP {
                    break;
                }
                self.skip_nested(field_type, depth + 1)?;
            },
            ttype::MAP => {
                let key_type = self.read_byte()?;
                let value_type = self.read_byte()?;
                let size = self.read_size()?;
                for _ in 0..size {
                    self.skip_nested(key_type, depth + 1)?;
                    self.skip_nested(value_type, depth + 1)?;
                }
            }
            ttype::SET | ttype::LIST => {
                let (elem_type, size) = self.read_list_begin()?;
                for _ in 0..size {
                    self.skip_nested(elem_type, depth + 1)?;
                }
            }
            other => return Err(ProtocolError::UnknownType(other)),
        }

        Ok(())
    }

    pub fn read_application_exception(&mut self) -> Result<ApplicationException, ProtocolError> {
        let mut message = String::new();
        let mut kind = ExceptionKind::Unknown;

        self.read_struct(|reader, field_type, id| match (id, field_type) {
            (1, ttype::STRING) => {
                message = reader.read_string()?;
                Ok(())
            }
            (2, ttype::I32) => {
                kind = ExceptionKind::from(reader.read_i32()?);
                Ok(())
            }
            _ => reader.skip(field_type),
        })?;

        Ok(ApplicationException { kind, message })
    }
}

/// Decode the argument struct of a call whose header was already read.
///
/// Unknown methods and non-call messages have their payload skipped so the
/// stream stays on a message boundary.
pub fn read_request<R: Read>(
    header: &MessageHeader,
    reader: &mut ProtocolReader<R>,
) -> Result<RpcRequest, ProtocolError> {
    if !matches!(header.kind, MessageType::Call | MessageType::Oneway) {
        reader.skip(ttype::STRUCT)?;
        return Err(ProtocolError::UnexpectedMessage(header.kind));
    }

    match header.name.as_str() {
        methods::TRANSLATE => {
            let mut source = None;
            reader.read_struct(|reader, field_type, id| match (id, field_type) {
                (1, ttype::STRING) => {
                    source = Some(reader.read_string()?);
                    Ok(())
                }
                _ => reader.skip(field_type),
            })?;
            source
                .map(|source| RpcRequest::Translate { source })
                .ok_or(ProtocolError::MissingField("source"))
        }
        methods::BATCH_TRANSLATE => {
            let mut sources = None;
            reader.read_struct(|reader, field_type, id| match (id, field_type) {
                (1, ttype::LIST) => {
                    sources = Some(reader.read_string_list("source")?);
                    Ok(())
                }
                _ => reader.skip(field_type),
            })?;
            sources
                .map(|sources| RpcRequest::BatchTranslate { sources })
                .ok_or(ProtocolError::MissingField("source"))
        }
        _ => {
            reader.skip(ttype::STRUCT)?;
            Err(ProtocolError::UnknownMethod(header.name.clone()))
        }
    }
}

/// Decode the result struct of a reply for `expected` (client side)
pub fn read_reply<R: Read>(
    header: &MessageHeader,
    reader: &mut ProtocolReader<R>,
    expected: &str,
) -> Result<RpcReply, ProtocolError> {
    if header.kind == MessageType::Exception {
        let exc = reader.read_application_exception()?;
        return Err(ProtocolError::Application(exc));
    }
    if header.kind != MessageType::Reply {
        reader.skip(ttype::STRUCT)?;
        return Err(ProtocolError::UnexpectedMessage(header.kind));
    }
    if header.name != expected {
        reader.skip(ttype::STRUCT)?;
        return Err(ProtocolError::WrongMethodName {
            expected: expected.to_string(),
            actual: header.name.clone(),
        });
    }

    let mut reply = None;
    reader.read_struct(|reader, field_type, id| match (id, field_type, expected) {
        (0, ttype::STRING, methods::TRANSLATE) => {
            reply = Some(RpcReply::Translate(reader.read_string()?));
            Ok(())
        }
        (0, ttype::LIST, methods::BATCH_TRANSLATE) => {
            reply = Some(RpcReply::BatchTranslate(reader.read_string_list("success")?));
            Ok(())
        }
        _ => reader.skip(field_type),
    })?;

    reply.ok_or_else(|| ProtocolError::MissingResult(expected.to_string()))
}

// Writers. Messages are assembled in memory and written with one call.

fn write_i16(data: &mut Vec<u8>, value: i16) {
    data.extend_from_slice(&value.to_be_bytes());
}

fn write_i32(data: &mut Vec<u8>, value: i32) {
    data.extend_from_slice(&value.to_be_bytes());
}

fn write_string(data: &mut Vec<u8>, value: &str) {
    write_i32(data, value.len() as i32);
    data.extend_from_slice(value.as_bytes());
}

fn write_field_begin(data: &mut Vec<u8>, field_type: u8, id: i16) {
    data.push(field_type);
    write_i16(data, id);
}

fn write_string_list(data: &mut Vec<u8>, items: &[String]) {
    data.push(ttype::STRING);
    write_i32(data, items.len() as i32);
    for item in items {
        write_string(data, item);
    }
}

pub fn write_message_begin(data: &mut Vec<u8>, name: &str, kind: MessageType, seq_id: i32) {
    write_i32(data, (VERSION_1 | kind as u32) as i32);
    write_string(data, name);
    write_i32(data, seq_id);
}

/// Serialize a call (client side)
pub fn encode_call(seq_id: i32, request: &RpcRequest) -> Vec<u8> {
    let mut data = Vec::new();
    write_message_begin(&mut data, request.method(), MessageType::Call, seq_id);

    match request {
        RpcRequest::Translate { source } => {
            write_field_begin(&mut data, ttype::STRING, 1);
            write_string(&mut data, source);
        }
        RpcRequest::BatchTranslate { sources } => {
            write_field_begin(&mut data, ttype::LIST, 1);
            write_string_list(&mut data, sources);
        }
    }
    data.push(ttype::STOP);

    data
}

/// Serialize a successful reply
pub fn encode_reply(seq_id: i32, reply: &RpcReply) -> Vec<u8> {
    let mut data = Vec::new();
    write_message_begin(&mut data, reply.method(), MessageType::Reply, seq_id);

    // Result struct: field 0 is the return value
    match reply {
        RpcReply::Translate(text) => {
            write_field_begin(&mut data, ttype::STRING, 0);
            write_string(&mut data, text);
        }
        RpcReply::BatchTranslate(texts) => {
            write_field_begin(&mut data, ttype::LIST, 0);
            write_string_list(&mut data, texts);
        }
    }
    data.push(ttype::STOP);

    data
}

/// Serialize an exception reply
pub fn encode_exception(method: &str, seq_id: i32, exc: &ApplicationException) -> Vec<u8> {
    let mut data = Vec::new();
    write_message_begin(&mut data, method, MessageType::Exception, seq_id);

    write_field_begin(&mut data, ttype::STRING, 1);
    write_string(&mut data, &exc.message);
    write_field_begin(&mut data, ttype::I32, 2);
    write_i32(&mut data, exc.kind as i32);
    data.push(ttype::STOP);

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn reader(data: &[u8]) -> ProtocolReader<Cursor<&[u8]>> {
        ProtocolReader::new(Cursor::new(data), 1024)
    }

    #[test]
    fn test_translate_call_wire_layout() {
        let bytes = encode_call(7, &RpcRequest::Translate { source: "hi".to_string() });

        let mut expected = vec![0x80, 0x01, 0x00, 0x01];
        expected.extend_from_slice(&[0, 0, 0, 9]);
        expected.extend_from_slice(b"translate");
        expected.extend_from_slice(&[0, 0, 0, 7]);
        expected.extend_from_slice(&[ttype::STRING, 0, 1]);
        expected.extend_from_slice(&[0, 0, 0, 2]);
        expected.extend_from_slice(b"hi");
        expected.push(ttype::STOP);

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_read_batch_request() {
        let sources = vec!["a b".to_string(), "c".to_string()];
        let bytes = encode_call(3, &RpcRequest::BatchTranslate { sources: sources.clone() });

        let mut reader = reader(&bytes);
        let header = reader.read_message_begin().unwrap();
        assert_eq!(header.name, "batch_translate");
        assert_eq!(header.kind, MessageType::Call);
        assert_eq!(header.seq_id, 3);

        let request = read_request(&header, &mut reader).unwrap();
        assert_eq!(request, RpcRequest::BatchTranslate { sources });
    }

    #[test]
    fn test_old_style_header() {
        let mut bytes = Vec::new();
        write_i32(&mut bytes, 9);
        bytes.extend_from_slice(b"translate");
        bytes.push(MessageType::Call as u8);
        write_i32(&mut bytes, 42);

        let header = reader(&bytes).read_message_begin().unwrap();
        assert_eq!(header.name, "translate");
        assert_eq!(header.seq_id, 42);
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = Vec::new();
        write_i32(&mut bytes, 0x8002_0001u32 as i32);

        match reader(&bytes).read_message_begin() {
            Err(ProtocolError::BadVersion(v)) => assert_eq!(v, 0x8002_0000),
            other => panic!("Expected BadVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_is_skipped() {
        let mut bytes = Vec::new();
        write_message_begin(&mut bytes, "detect_language", MessageType::Call, 1);
        write_field_begin(&mut bytes, ttype::STRING, 1);
        write_string(&mut bytes, "Hallo");
        write_field_begin(&mut bytes, ttype::MAP, 2);
        bytes.extend_from_slice(&[ttype::STRING, ttype::I32]);
        write_i32(&mut bytes, 1);
        write_string(&mut bytes, "k");
        write_i32(&mut bytes, 5);
        bytes.push(ttype::STOP);
        bytes.extend(encode_call(2, &RpcRequest::Translate { source: "x".to_string() }));

        let mut reader = reader(&bytes);
        let header = reader.read_message_begin().unwrap();
        let err = read_request(&header, &mut reader).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.to_exception().kind, ExceptionKind::UnknownMethod);

        // Next message is still readable
        let header = reader.read_message_begin().unwrap();
        assert_eq!(header.seq_id, 2);
        let request = read_request(&header, &mut reader).unwrap();
        assert_eq!(request, RpcRequest::Translate { source: "x".to_string() });
    }

    #[test]
    fn test_missing_source_field() {
        let mut bytes = Vec::new();
        write_message_begin(&mut bytes, "translate", MessageType::Call, 1);
        bytes.push(ttype::STOP);

        let mut reader = reader(&bytes);
        let header = reader.read_message_begin().unwrap();
        match read_request(&header, &mut reader) {
            Err(ProtocolError::MissingField("source")) => {}
            other => panic!("Expected MissingField, got {:?}", other),
        }
    }

    #[test]
    fn test_string_size_limit() {
        let mut bytes = Vec::new();
        write_message_begin(&mut bytes, "translate", MessageType::Call, 1);
        write_field_begin(&mut bytes, ttype::STRING, 1);
        write_i32(&mut bytes, 4096);

        let mut reader = reader(&bytes);
        let header = reader.read_message_begin().unwrap();
        let err = read_request(&header, &mut reader).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeLimit { size: 4096, limit: 1024 }));
        assert!(!err.is_recoverable());
        assert_eq!(err.to_exception().kind, ExceptionKind::ProtocolError);
    }

    #[test]
    fn test_batch_size_limit_covers_whole_list() {
        // Each sentence fits the limit on its own, the batch does not
        let sources: Vec<String> = (0..8).map(|_| "x".repeat(1000)).collect();
        let bytes = encode_call(1, &RpcRequest::BatchTranslate { sources });

        let mut reader = reader(&bytes);
        let header = reader.read_message_begin().unwrap();
        match read_request(&header, &mut reader) {
            Err(ProtocolError::SizeLimit { size, limit }) => {
                assert_eq!(limit, 1024);
                assert_eq!(size, 2000);
            }
            other => panic!("Expected SizeLimit, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_within_limit() {
        let sources: Vec<String> = (0..4).map(|i| format!("{}", i).repeat(250)).collect();
        let bytes = encode_call(1, &RpcRequest::BatchTranslate { sources: sources.clone() });

        let mut reader = reader(&bytes);
        let header = reader.read_message_begin().unwrap();
        assert_eq!(read_request(&header, &mut reader).unwrap(), RpcRequest::BatchTranslate { sources });
    }

    #[test]
    fn test_truncated_message_is_eof() {
        let bytes = encode_call(1, &RpcRequest::Translate { source: "hello".to_string() });
        let truncated = &bytes[..bytes.len() - 3];

        let mut reader = reader(truncated);
        let header = reader.read_message_begin().unwrap();
        let err = read_request(&header, &mut reader).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn test_exception_reply_surfaces_as_error() {
        let exc = ApplicationException::internal_error("engine failed");
        let bytes = encode_exception("batch_translate", 9, &exc);
        assert_eq!(&bytes[..4], &[0x80, 0x01, 0x00, 0x03]);

        let mut reader = reader(&bytes);
        let header = reader.read_message_begin().unwrap();
        match read_reply(&header, &mut reader, "batch_translate") {
            Err(ProtocolError::Application(got)) => assert_eq!(got, exc),
            other => panic!("Expected Application error, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_for_other_method_rejected() {
        let bytes = encode_reply(1, &RpcReply::Translate("x".to_string()));

        let mut reader = reader(&bytes);
        let header = reader.read_message_begin().unwrap();
        let err = read_reply(&header, &mut reader, "batch_translate").unwrap_err();
        assert!(matches!(err, ProtocolError::WrongMethodName { .. }));
    }
}
