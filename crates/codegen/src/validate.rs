use thiserror::Error;

use crate::model::MachineSchema;
use crate::names::is_valid_identifier;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("machine name is required")]
    MissingMachineName,
    #[error("machine name `{0}` is not a valid identifier")]
    InvalidMachineName(String),
    #[error("state name is required")]
    MissingStateName,
    #[error("state name `{0}` is not a valid identifier")]
    InvalidStateName(String),
    #[error("state name `{0}` is reserved")]
    ReservedStateName(String),
    #[error("state `{0}` is declared more than once")]
    DuplicateState(String),
    #[error("exactly one entrypoint state is required, found {0}")]
    EntrypointCount(usize),
    #[error("at least one terminal state is required")]
    NoTerminalState,
    #[error("terminal state `{0}` cannot declare transitions")]
    TerminalWithTransitions(String),
    #[error("terminal state `{0}` cannot declare inputs")]
    TerminalWithInputs(String),
    #[error("state `{state}`: workers must be at least 1")]
    InvalidWorkers { state: String },
    #[error("state `{state}`: transition target `{target}` is not a declared state")]
    UnknownTransitionTarget { state: String, target: String },
    #[error("state `{state}`: input type `{input}` is not declared under `types`")]
    UnknownInputType { state: String, input: String },
    #[error("no machine documents in input")]
    EmptyInput,
}

/// Schema well-formedness. Generation refuses any schema this rejects.
pub fn validate(schema: &MachineSchema) -> Result<(), SchemaError> {
    if schema.name.is_empty() {
        return Err(SchemaError::MissingMachineName);
    }
    if !is_valid_identifier(&schema.name) {
        return Err(SchemaError::InvalidMachineName(schema.name.clone()));
    }

    let mut seen = std::collections::BTreeSet::new();
    for state in &schema.states {
        if state.name.is_empty() {
            return Err(SchemaError::MissingStateName);
        }
        if !is_valid_identifier(&state.name) {
            return Err(SchemaError::InvalidStateName(state.name.clone()));
        }
        if state.name.starts_with("__") {
            return Err(SchemaError::ReservedStateName(state.name.clone()));
        }
        if !seen.insert(state.name.as_str()) {
            return Err(SchemaError::DuplicateState(state.name.clone()));
        }
    }

    let entrypoints = schema.states.iter().filter(|state| state.entrypoint).count();
    if entrypoints != 1 {
        return Err(SchemaError::EntrypointCount(entrypoints));
    }
    if schema.terminal_states().next().is_none() {
        return Err(SchemaError::NoTerminalState);
    }

    for state in &schema.states {
        if state.terminal {
            if !state.transitions.is_empty() {
                return Err(SchemaError::TerminalWithTransitions(state.name.clone()));
            }
            if !state.inputs.is_empty() {
                return Err(SchemaError::TerminalWithInputs(state.name.clone()));
            }
        }
        if state.workers < 1 {
            return Err(SchemaError::InvalidWorkers { state: state.name.clone() });
        }
        for target in &state.transitions {
            if schema.state(target).is_none() {
                return Err(SchemaError::UnknownTransitionTarget {
                    state: state.name.clone(),
                    target: target.clone(),
                });
            }
        }
        for input in &state.inputs {
            if !schema.types.contains_key(input) {
                return Err(SchemaError::UnknownInputType {
                    state: state.name.clone(),
                    input: input.clone(),
                });
            }
        }
    }

    Ok(())
}
