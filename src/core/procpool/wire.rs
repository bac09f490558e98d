// src/core/procpool/wire.rs

//! The request/reply tuple carried inside each framed message. Both sides
//! use the same serializer (`bincode`) for both directions, matching the
//! source material's contract that a serialization failure on the worker
//! side must still be reportable (as a textual traceback, never a
//! raw struct that might itself fail to encode).

use bincode::{Decode, Encode};

use crate::core::CoreResult;
use crate::core::errors::CoreError;

/// `(method_name, args)` as sent from the parent to a worker.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Request {
    pub method: String,
    pub args: Vec<u8>,
}

/// The worker's reply. The three variants are exactly `status ∈ {0, 1, 2}`
/// from the specification: `Ok` is status 0, `Raised` is status 1 (carrying
/// the remote traceback alongside a serialized representation of the
/// exception), `SerializationError` is status 2 (the exception itself could
/// not be serialized, so only a traceback string survives).
#[derive(Debug, Clone, Encode, Decode)]
pub enum Reply {
    Ok(Vec<u8>),
    Raised { message: String, traceback: String },
    SerializationError { traceback: String },
}

const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

pub fn encode_request(method: &str, args: Vec<u8>) -> CoreResult<Vec<u8>> {
    let req = Request {
        method: method.to_string(),
        args,
    };
    bincode::encode_to_vec(&req, BINCODE_CONFIG).map_err(CoreError::from)
}

pub fn decode_request(bytes: &[u8]) -> CoreResult<Request> {
    let (req, _) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)?;
    Ok(req)
}

pub fn encode_reply(reply: &Reply) -> CoreResult<Vec<u8>> {
    bincode::encode_to_vec(reply, BINCODE_CONFIG).map_err(CoreError::from)
}

pub fn decode_reply(bytes: &[u8]) -> CoreResult<Reply> {
    let (reply, _) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)?;
    Ok(reply)
}
