// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! A codec turns a typed value into the opaque bytes carried by a message and
//! back. Codecs hold no state, so any number of them can be used side by side.
//!
//! - [`JsonCodec`]: human-readable JSON (`serde_json`)
//! - [`BincodeCodec`]: compact binary records (`bincode`). Field names are not
//!   transmitted, so producer and consumer must agree on the schema.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};

/// Content type set on JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type set on binary messages
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Serialization strategy for message payloads.
pub trait Codec: Send + Sync {
    /// MIME type advertised in the message properties.
    fn content_type(&self) -> &'static str;

    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized;

    fn decode<T>(&self, data: &[u8]) -> Result<T, AmqpError>
    where
        T: DeserializeOwned;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value).map_err(|err| AmqpError::EncodeError(err.to_string()))
    }

    fn decode<T>(&self, data: &[u8]) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(data).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn content_type(&self) -> &'static str {
        BINARY_CONTENT_TYPE
    }

    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        bincode::serialize(value).map_err(|err| AmqpError::EncodeError(err.to_string()))
    }

    fn decode<T>(&self, data: &[u8]) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        bincode::deserialize(data).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}
