//! nmt_rpc: Thrift RPC front end for an external neural machine
//! translation engine.
//!
//! Remote clients call `translate` or `batch_translate`; the server
//! optionally applies BPE segmentation, forwards the sentences to the
//! engine one call at a time, and strips the subword markers from the
//! output.

pub mod bpe;
pub mod config;
pub mod device;
pub mod error;
pub mod rpc;
pub mod startup;
pub mod translation;

pub use error::{Error, Result};
