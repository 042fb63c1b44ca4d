//! Task payloads are JSON-encoded positional tuples: the entrypoint payload
//! holds the submitted arguments, and every committed transition row holds
//! the argument tuple passed to the target state. The store treats both as
//! opaque bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::MachineError;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MachineError> {
    serde_json::to_vec(value).map_err(MachineError::Encode)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, MachineError> {
    serde_json::from_slice(payload).map_err(MachineError::Decode)
}
