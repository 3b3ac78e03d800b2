//! Translate RPC service
//!
//! Thrift binary protocol (unframed stream transport) carrying the two
//! remote operations of the `Translate` service:
//!
//!   translate(1: string source) -> string
//!   batch_translate(1: list<string> source) -> list<string>

pub mod protocol;
pub mod service;
pub mod client;

pub use protocol::{
    ApplicationException, ExceptionKind, MessageHeader, MessageType, ProtocolError,
    ProtocolReader, RpcReply, RpcRequest,
};
pub use service::{RpcService, ServiceConfig, ServiceStats};
pub use client::{ClientPool, PooledClient, TranslateClient};

/// Port the server binds in the reference deployment
pub const DEFAULT_PORT: u16 = 20000;

/// Port the reference test client connects to
pub const DEFAULT_CLIENT_PORT: u16 = 9095;

/// Largest string or list payload accepted on the wire
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Strict binary protocol version word
pub const VERSION_1: u32 = 0x8001_0000;
pub const VERSION_MASK: u32 = 0xFFFF_0000;

/// Remote method names
pub mod methods {
    pub const TRANSLATE: &str = "translate";
    pub const BATCH_TRANSLATE: &str = "batch_translate";
}

/// Thrift wire type tags
pub mod ttype {
    pub const STOP: u8 = 0;
    pub const VOID: u8 = 1;
    pub const BOOL: u8 = 2;
    pub const BYTE: u8 = 3;
    pub const DOUBLE: u8 = 4;
    pub const I16: u8 = 6;
    pub const I32: u8 = 8;
    pub const I64: u8 = 10;
    pub const STRING: u8 = 11;
    pub const STRUCT: u8 = 12;
    pub const MAP: u8 = 13;
    pub const SET: u8 = 14;
    pub const LIST: u8 = 15;
}
