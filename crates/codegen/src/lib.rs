pub mod generate;
pub mod model;
pub mod names;
pub mod validate;

pub use generate::{generate, CodegenError};
pub use model::{
    emit_schema, parse_schemas, MachineSchema, StateSchema, TypeRef, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_WORKERS,
};
pub use validate::{validate, SchemaError};
