//! Serialization of pages and persisted artifacts.
//!
//! Everything that reaches the blob store goes through this module, so the
//! encoding stays swappable. Encoding a value cannot fail; decoding maps
//! damage to the corruption errors recovery treats as fatal.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::page::Page;
use crate::PageId;

pub fn encode_page(page: &Page) -> Vec<u8> {
    bincode::serialize(page).expect("page serialization is infallible")
}

pub fn decode_page(page_id: PageId, bytes: &[u8]) -> Result<Page> {
    bincode::deserialize(bytes).map_err(|_| EngineError::CorruptPage(page_id))
}

pub fn encode_artifact<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("artifact serialization is infallible")
}

pub fn decode_artifact<T: DeserializeOwned>(name: &str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|err| EngineError::CorruptLog(format!("{name} artifact: {err}")))
}
