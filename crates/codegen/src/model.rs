use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::validate::SchemaError;

pub const DEFAULT_WORKERS: u32 = 1;
pub const DEFAULT_QUEUE_CAPACITY: u32 = 16;

/// Declarative machine description, one YAML document per machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineSchema {
    pub name: String,
    /// Input-type name to rendered Rust type; `package` qualifies the type
    /// with a module path, otherwise it must be in scope at the include
    /// site.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub types: BTreeMap<String, TypeRef>,
    pub states: Vec<StateSchema>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeRef {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub entrypoint: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub terminal: bool,
    #[serde(default = "default_workers", skip_serializing_if = "is_default_workers")]
    pub workers: u32,
    #[serde(default = "default_queue", skip_serializing_if = "is_default_queue")]
    pub queue: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<String>,
}

impl MachineSchema {
    pub fn entrypoint(&self) -> Option<&StateSchema> {
        self.states.iter().find(|state| state.entrypoint)
    }

    pub fn terminal_states(&self) -> impl Iterator<Item = &StateSchema> {
        self.states.iter().filter(|state| state.terminal)
    }

    pub fn state(&self, name: &str) -> Option<&StateSchema> {
        self.states.iter().find(|state| state.name == name)
    }
}

/// Parses every YAML document in `input`, in order.
pub fn parse_schemas(input: &str) -> Result<Vec<MachineSchema>, SchemaError> {
    let mut schemas = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        schemas.push(MachineSchema::deserialize(document)?);
    }
    Ok(schemas)
}

pub fn emit_schema(schema: &MachineSchema) -> Result<String, SchemaError> {
    Ok(serde_yaml::to_string(schema)?)
}

fn default_workers() -> u32 {
    DEFAULT_WORKERS
}

fn default_queue() -> u32 {
    DEFAULT_QUEUE_CAPACITY
}

fn is_default_workers(value: &u32) -> bool {
    *value == DEFAULT_WORKERS
}

fn is_default_queue(value: &u32) -> bool {
    *value == DEFAULT_QUEUE_CAPACITY
}

fn is_false(value: &bool) -> bool {
    !*value
}
