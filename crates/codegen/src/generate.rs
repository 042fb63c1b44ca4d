use proc_macro2::{Literal, TokenStream};
use quote::{format_ident, quote};
use syn::Ident;

use crate::model::{MachineSchema, StateSchema};
use crate::names::{is_valid_identifier, pascal_case, screaming_snake_case, snake_case};
use crate::validate::{validate, SchemaError};

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("module name `{0}` is not a valid identifier")]
    InvalidModuleName(String),
    #[error("type `{name}` does not render to a valid Rust path: {source}")]
    InvalidType { name: String, source: syn::Error },
    #[error("generated source failed to parse: {0}")]
    Render(#[from] syn::Error),
}

/// Renders one validated schema into a formatted Rust compilation unit:
/// state constants, typed messages, per-state transition surfaces, the
/// staged builder, and the concrete machine with its worker loops.
pub fn generate(schema: &MachineSchema, module: &str) -> Result<String, CodegenError> {
    validate(schema)?;
    if !is_valid_identifier(module) {
        return Err(CodegenError::InvalidModuleName(module.to_string()));
    }

    let machine = MachineModel::new(schema)?;
    let tokens = machine.render();
    let file: syn::File = syn::parse2(tokens)?;

    Ok(format!("{}\n{}", header(schema, module), prettyplease::unparse(&file)))
}

fn header(schema: &MachineSchema, module: &str) -> String {
    format!(
        "//! Generated by statecraft from machine `{name}`. Do not edit.\n\
         //!\n\
         //! Include as module `{module}` next to the input types it references;\n\
         //! the generated code needs the statecraft crates plus anyhow, flume,\n\
         //! tokio, tokio-util, and tracing.\n",
        name = schema.name,
        module = module,
    )
}

struct MachineModel<'a> {
    name_literal: &'a str,
    machine_ident: Ident,
    inner_ident: Ident,
    build_stage_ident: Ident,
    builder_fn_ident: Ident,
    states: Vec<StateModel<'a>>,
    entry_index: usize,
}

struct StateModel<'a> {
    schema: &'a StateSchema,
    const_ident: Ident,
    message_ident: Ident,
    fn_type_ident: Ident,
    fn_field_ident: Ident,
    tx_ident: Ident,
    rx_ident: Ident,
    transitions_ident: Ident,
    stage_ident: Ident,
    stage_method_ident: Ident,
    spawn_ident: Ident,
    run_ident: Ident,
    to_method_ident: Ident,
    inputs: Vec<syn::Type>,
    params: Vec<Ident>,
}

impl<'a> MachineModel<'a> {
    fn new(schema: &'a MachineSchema) -> Result<Self, CodegenError> {
        let machine_pascal = pascal_case(&schema.name);

        let states = schema
            .states
            .iter()
            .map(|state| StateModel::new(schema, state, &machine_pascal))
            .collect::<Result<Vec<_>, _>>()?;

        let entry_index = schema
            .states
            .iter()
            .position(|state| state.entrypoint)
            .ok_or(SchemaError::EntrypointCount(0))?;

        Ok(Self {
            name_literal: &schema.name,
            machine_ident: format_ident!("{machine_pascal}Machine"),
            inner_ident: format_ident!("{machine_pascal}Inner"),
            build_stage_ident: format_ident!("{machine_pascal}BuildStage"),
            builder_fn_ident: format_ident!("{}_builder", snake_case(&schema.name)),
            states,
            entry_index,
        })
    }

    fn entry(&self) -> &StateModel<'a> {
        &self.states[self.entry_index]
    }

    fn state_named(&self, name: &str) -> Option<&StateModel<'a>> {
        self.states.iter().find(|state| state.schema.name == name)
    }

    fn render(&self) -> TokenStream {
        let uses = self.render_uses();
        let consts = self.render_state_consts();
        let fn_types = self.render_fn_types();
        let messages = self.render_messages();
        let transitions = self.render_transition_surfaces();
        let builder = self.render_builder();
        let inner = self.render_inner();
        let machine = self.render_machine();
        let resume = self.render_resume();
        let workers = self.render_workers();

        quote! {
            #uses
            #consts
            #fn_types
            #messages
            #transitions
            #builder
            #inner
            #machine
            #resume
            #workers
        }
    }

    fn render_uses(&self) -> TokenStream {
        quote! {
            use super::*;

            use std::future::Future;
            use std::sync::atomic::{AtomicBool, Ordering};
            use std::sync::Arc;

            use tokio_util::sync::CancellationToken;

            use statecraft_core::{State, TaskContext, TaskId};
            use statecraft_runtime::{
                codec, recv_or_cancel, send_or_cancel, MachineCore, MachineError, MachineOption,
                StartLock, TransitionFuture,
            };
        }
    }

    fn render_state_consts(&self) -> TokenStream {
        let consts = self.states.iter().map(|state| {
            let ident = &state.const_ident;
            let name = &state.schema.name;
            quote! { pub const #ident: State = State::from_static(#name); }
        });

        let terminal_consts: Vec<&Ident> = self
            .states
            .iter()
            .filter(|state| state.schema.terminal)
            .map(|state| &state.const_ident)
            .collect();
        let terminal_count = Literal::usize_unsuffixed(terminal_consts.len());

        quote! {
            #( #consts )*

            const TERMINAL_STATES: [State; #terminal_count] = [ #( #terminal_consts ),* ];
        }
    }

    fn render_fn_types(&self) -> TokenStream {
        let aliases = self.states.iter().map(|state| {
            let fn_type = &state.fn_type_ident;
            let inputs = &state.inputs;
            if state.schema.terminal {
                quote! {
                    type #fn_type = Arc<
                        dyn Fn(TaskContext #(, #inputs)*) -> TransitionFuture + Send + Sync,
                    >;
                }
            } else {
                let transitions = &state.transitions_ident;
                quote! {
                    type #fn_type = Arc<
                        dyn Fn(TaskContext, #transitions #(, #inputs)*) -> TransitionFuture
                            + Send
                            + Sync,
                    >;
                }
            }
        });

        quote! { #( #aliases )* }
    }

    fn render_messages(&self) -> TokenStream {
        let messages = self.states.iter().map(|state| {
            let message = &state.message_ident;
            let params = &state.params;
            let inputs = &state.inputs;
            quote! {
                pub struct #message {
                    pub task_id: TaskId,
                    pub from: State,
                    pub attempt: u32,
                    #( pub #params: #inputs, )*
                }
            }
        });

        quote! { #( #messages )* }
    }

    fn render_transition_surfaces(&self) -> TokenStream {
        let surfaces = self.states.iter().filter(|state| !state.schema.terminal).map(|state| {
            let surface = &state.transitions_ident;
            let inner = &self.inner_ident;

            let methods = state.schema.transitions.iter().filter_map(|target| {
                let target = self.state_named(target)?;
                let method = &target.to_method_ident;
                let target_const = &target.const_ident;
                let target_message = &target.message_ident;
                let target_tx = &target.tx_ident;
                let params = &target.params;
                let inputs = &target.inputs;

                Some(quote! {
                    pub async fn #method(&self #(, #params: #inputs)*) -> Result<(), MachineError> {
                        self.take()?;
                        let payload = codec::encode(&( #( &#params, )* ))?;
                        self.inner.core.commit_transition(&self.ctx, &#target_const, &payload).await?;
                        let message = #target_message {
                            task_id: self.ctx.task_id(),
                            from: self.ctx.state(),
                            attempt: 0,
                            #( #params, )*
                        };
                        send_or_cancel(&self.inner.core, &self.inner.#target_tx, message).await
                    }
                })
            });

            quote! {
                pub struct #surface {
                    inner: Arc<#inner>,
                    ctx: TaskContext,
                    taken: Arc<AtomicBool>,
                }

                impl #surface {
                    #( #methods )*

                    fn take(&self) -> Result<(), MachineError> {
                        if self.taken.swap(true, Ordering::SeqCst) {
                            return Err(MachineError::AlreadyTransitioned);
                        }
                        Ok(())
                    }
                }
            }
        });

        quote! { #( #surfaces )* }
    }

    fn render_builder(&self) -> TokenStream {
        let builder_fn = &self.builder_fn_ident;
        let first_stage = &self.states[0].stage_ident;

        let constructor = quote! {
            pub fn #builder_fn() -> #first_stage {
                #first_stage { lock: Arc::new(StartLock::new()) }
            }
        };

        let stages = self.states.iter().enumerate().map(|(index, state)| {
            let stage = &state.stage_ident;
            let method = &state.stage_method_ident;
            let fn_field = &state.fn_field_ident;
            let inputs = &state.inputs;
            let params = &state.params;

            let prior_fields: Vec<&Ident> =
                self.states[..index].iter().map(|prior| &prior.fn_field_ident).collect();
            let prior_types: Vec<&Ident> =
                self.states[..index].iter().map(|prior| &prior.fn_type_ident).collect();

            let next_stage = match self.states.get(index + 1) {
                Some(next) => &next.stage_ident,
                None => &self.build_stage_ident,
            };

            let (fn_bound, closure) = if state.schema.terminal {
                (
                    quote! { Fn(TaskContext #(, #inputs)*) -> Fut },
                    quote! {
                        Arc::new(move |ctx #(, #params)*| Box::pin(transition(ctx #(, #params)*)))
                    },
                )
            } else {
                let transitions = &state.transitions_ident;
                (
                    quote! { Fn(TaskContext, #transitions #(, #inputs)*) -> Fut },
                    quote! {
                        Arc::new(move |ctx, transitions #(, #params)*| {
                            Box::pin(transition(ctx, transitions #(, #params)*))
                        })
                    },
                )
            };

            quote! {
                #[derive(Clone)]
                pub struct #stage {
                    lock: Arc<StartLock>,
                    #( #prior_fields: #prior_types, )*
                }

                impl #stage {
                    pub fn #method<F, Fut>(self, transition: F) -> #next_stage
                    where
                        F: #fn_bound + Send + Sync + 'static,
                        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
                    {
                        #next_stage {
                            lock: self.lock,
                            #( #prior_fields: self.#prior_fields, )*
                            #fn_field: #closure,
                        }
                    }
                }
            }
        });

        let build_stage = self.render_build_stage();

        quote! {
            #constructor
            #( #stages )*
            #build_stage
        }
    }

    fn render_build_stage(&self) -> TokenStream {
        let build_stage = &self.build_stage_ident;
        let machine = &self.machine_ident;
        let inner = &self.inner_ident;
        let name = self.name_literal;

        let fn_fields: Vec<&Ident> =
            self.states.iter().map(|state| &state.fn_field_ident).collect();
        let fn_types: Vec<&Ident> = self.states.iter().map(|state| &state.fn_type_ident).collect();

        let queues = self.states.iter().map(|state| {
            let tx = &state.tx_ident;
            let rx = &state.rx_ident;
            let capacity = Literal::usize_unsuffixed(state.schema.queue as usize);
            quote! { let (#tx, #rx) = flume::bounded(#capacity); }
        });
        let tx_fields: Vec<&Ident> = self.states.iter().map(|state| &state.tx_ident).collect();

        let spawns = self.states.iter().map(|state| {
            let spawn = &state.spawn_ident;
            let rx = &state.rx_ident;
            quote! { #spawn(&inner, #rx); }
        });

        quote! {
            #[derive(Clone)]
            pub struct #build_stage {
                lock: Arc<StartLock>,
                #( #fn_fields: #fn_types, )*
            }

            impl #build_stage {
                pub async fn build_and_start(
                    self,
                    shutdown: CancellationToken,
                    options: impl IntoIterator<Item = MachineOption>,
                ) -> Result<#machine, MachineError> {
                    self.lock.try_start()?;
                    let core = MachineCore::initialize(#name, shutdown, options).await?;

                    #( #queues )*

                    let inner = Arc::new(#inner {
                        core,
                        #( #fn_fields: self.#fn_fields, )*
                        #( #tx_fields, )*
                    });

                    #( #spawns )*

                    resume_open_tasks(&inner).await?;

                    Ok(#machine { inner })
                }
            }
        }
    }

    fn render_inner(&self) -> TokenStream {
        let inner = &self.inner_ident;
        let fn_fields: Vec<&Ident> =
            self.states.iter().map(|state| &state.fn_field_ident).collect();
        let fn_types: Vec<&Ident> = self.states.iter().map(|state| &state.fn_type_ident).collect();
        let tx_fields: Vec<&Ident> = self.states.iter().map(|state| &state.tx_ident).collect();
        let messages: Vec<&Ident> = self.states.iter().map(|state| &state.message_ident).collect();

        quote! {
            struct #inner {
                core: MachineCore,
                #( #fn_fields: #fn_types, )*
                #( #tx_fields: flume::Sender<#messages>, )*
            }
        }
    }

    fn render_machine(&self) -> TokenStream {
        let machine = &self.machine_ident;
        let inner = &self.inner_ident;
        let entry = self.entry();
        let entry_message = &entry.message_ident;
        let entry_tx = &entry.tx_ident;
        let params = &entry.params;
        let inputs = &entry.inputs;

        quote! {
            pub struct #machine {
                inner: Arc<#inner>,
            }

            impl #machine {
                pub async fn submit(&self #(, #params: #inputs)*) -> Result<TaskId, MachineError> {
                    let payload = codec::encode(&( #( &#params, )* ))?;
                    let task = self.inner.core.create_task(&payload).await?;
                    let message = #entry_message {
                        task_id: task.id,
                        from: State::INITIAL,
                        attempt: 0,
                        #( #params, )*
                    };
                    send_or_cancel(&self.inner.core, &self.inner.#entry_tx, message).await?;
                    Ok(task.id)
                }
            }
        }
    }

    fn render_resume(&self) -> TokenStream {
        let inner = &self.inner_ident;

        let arms = self.states.iter().enumerate().filter(|(_, state)| !state.schema.terminal).map(
            |(index, state)| {
                let name = &state.schema.name;
                let pattern = if index == self.entry_index {
                    quote! { "__initial__" | #name }
                } else {
                    quote! { #name }
                };

                let state_const = &state.const_ident;
                let message = &state.message_ident;
                let tx = &state.tx_ident;
                let params = &state.params;
                let inputs = &state.inputs;

                quote! {
                    #pattern => {
                        let ( #( #params, )* ): ( #( #inputs, )* ) = match codec::decode(&task.payload) {
                            Ok(inputs) => inputs,
                            Err(error) => {
                                inner
                                    .core
                                    .fail_task(task.task_id, &task.state, &error.to_string())
                                    .await?;
                                continue;
                            }
                        };
                        let attempt = inner.core.prior_attempts(task.task_id, &#state_const).await?;
                        let message = #message {
                            task_id: task.task_id,
                            from: task.from.clone(),
                            attempt,
                            #( #params, )*
                        };
                        send_or_cancel(&inner.core, &inner.#tx, message).await?;
                    }
                }
            },
        );

        quote! {
            async fn resume_open_tasks(inner: &Arc<#inner>) -> Result<(), MachineError> {
                for task in inner.core.open_tasks(&TERMINAL_STATES).await? {
                    match task.state.as_str() {
                        #( #arms )*
                        _ => {
                            inner
                                .core
                                .fail_task(
                                    task.task_id,
                                    &task.state,
                                    "state is not part of the machine",
                                )
                                .await?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn render_workers(&self) -> TokenStream {
        let workers = self.states.iter().map(|state| {
            let inner = &self.inner_ident;
            let spawn = &state.spawn_ident;
            let run = &state.run_ident;
            let message = &state.message_ident;
            let worker_count = Literal::usize_unsuffixed(state.schema.workers as usize);

            let spawn_fn = quote! {
                fn #spawn(inner: &Arc<#inner>, queue: flume::Receiver<#message>) {
                    for _ in 0..#worker_count {
                        let inner = Arc::clone(inner);
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            while let Some(message) = recv_or_cancel(&inner.core, &queue).await {
                                #run(&inner, message).await;
                            }
                        });
                    }
                }
            };

            let run_fn = if state.schema.terminal {
                self.render_terminal_run(state)
            } else {
                self.render_worker_run(state)
            };

            quote! {
                #spawn_fn
                #run_fn
            }
        });

        quote! { #( #workers )* }
    }

    fn render_worker_run(&self, state: &StateModel<'_>) -> TokenStream {
        let inner = &self.inner_ident;
        let run = &state.run_ident;
        let message = &state.message_ident;
        let state_const = &state.const_ident;
        let surface = &state.transitions_ident;
        let fn_field = &state.fn_field_ident;
        let tx = &state.tx_ident;
        let params = &state.params;

        quote! {
            async fn #run(inner: &Arc<#inner>, message: #message) {
                let ctx = inner.core.task_context(&#state_const, message.task_id, message.attempt);
                let taken = Arc::new(AtomicBool::new(false));
                let transitions = #surface {
                    inner: Arc::clone(inner),
                    ctx: ctx.clone(),
                    taken: Arc::clone(&taken),
                };
                match (inner.#fn_field)(ctx.clone(), transitions #(, message.#params.clone())*).await {
                    Ok(()) => {
                        if !taken.load(Ordering::SeqCst) {
                            inner.core.complete_without_transition(&ctx);
                        }
                    }
                    Err(_) if inner.core.is_cancelled() => {}
                    Err(error) => {
                        let payload = match codec::encode(&( #( &message.#params, )* )) {
                            Ok(payload) => payload,
                            Err(encode_error) => {
                                let _ = inner
                                    .core
                                    .fail_task(
                                        message.task_id,
                                        &message.from,
                                        &encode_error.to_string(),
                                    )
                                    .await;
                                return;
                            }
                        };
                        let (attempt, delay) = match inner
                            .core
                            .fail_attempt(&ctx, &message.from, &#state_const, &payload, &error)
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(store_error) => {
                                tracing::error!(
                                    parent: ctx.span(),
                                    error = %store_error,
                                    "failed to record attempt"
                                );
                                (
                                    message.attempt,
                                    inner.core.backoff_delay(message.attempt.saturating_add(1)),
                                )
                            }
                        };
                        tokio::time::sleep(delay).await;
                        let retry = #message {
                            task_id: message.task_id,
                            from: message.from,
                            attempt,
                            #( #params: message.#params, )*
                        };
                        let _ = send_or_cancel(&inner.core, &inner.#tx, retry).await;
                    }
                }
            }
        }
    }

    fn render_terminal_run(&self, state: &StateModel<'_>) -> TokenStream {
        let inner = &self.inner_ident;
        let run = &state.run_ident;
        let message = &state.message_ident;
        let state_const = &state.const_ident;
        let fn_field = &state.fn_field_ident;
        let params = &state.params;

        quote! {
            async fn #run(inner: &Arc<#inner>, message: #message) {
                let ctx = inner.core.task_context(&#state_const, message.task_id, message.attempt);
                if let Err(error) =
                    (inner.#fn_field)(ctx.clone() #(, message.#params.clone())*).await
                {
                    tracing::warn!(
                        parent: ctx.span(),
                        error = %error,
                        "terminal state function returned an error"
                    );
                }
                inner.core.complete(&ctx, &#state_const);
            }
        }
    }
}

impl<'a> StateModel<'a> {
    fn new(
        schema: &'a MachineSchema,
        state: &'a StateSchema,
        machine_pascal: &str,
    ) -> Result<Self, CodegenError> {
        let pascal = pascal_case(&state.name);
        let snake = snake_case(&state.name);

        let inputs = state
            .inputs
            .iter()
            .map(|input| resolve_input_type(schema, input))
            .collect::<Result<Vec<_>, _>>()?;
        let params = (0..inputs.len()).map(|i| format_ident!("p{i}")).collect();

        Ok(Self {
            schema: state,
            const_ident: format_ident!("{}", screaming_snake_case(&state.name)),
            message_ident: format_ident!("{pascal}Message"),
            fn_type_ident: format_ident!("{pascal}Fn"),
            fn_field_ident: format_ident!("{snake}_fn"),
            tx_ident: format_ident!("{snake}_tx"),
            rx_ident: format_ident!("{snake}_rx"),
            transitions_ident: format_ident!("{pascal}Transitions"),
            stage_ident: format_ident!("{machine_pascal}{pascal}Stage"),
            stage_method_ident: format_ident!("{snake}_state"),
            spawn_ident: format_ident!("spawn_{snake}_workers"),
            run_ident: format_ident!("run_{snake}"),
            to_method_ident: format_ident!("to_{snake}"),
            inputs,
            params,
        })
    }
}

fn resolve_input_type(schema: &MachineSchema, input: &str) -> Result<syn::Type, CodegenError> {
    let type_ref = schema.types.get(input).ok_or_else(|| {
        CodegenError::Schema(SchemaError::UnknownInputType {
            state: String::new(),
            input: input.to_string(),
        })
    })?;

    let rendered = match &type_ref.package {
        Some(package) => format!("{package}::{}", type_ref.type_name),
        None => type_ref.type_name.clone(),
    };

    syn::parse_str::<syn::Type>(&rendered)
        .map_err(|source| CodegenError::InvalidType { name: input.to_string(), source })
}
