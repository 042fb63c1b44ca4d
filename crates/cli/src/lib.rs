use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use statecraft_codegen::{generate, names, parse_schemas, validate, SchemaError};

/// Exit codes mirror the failure classes: schema problems are the caller's
/// to fix, I/O problems are environmental.
const EXIT_SCHEMA: u8 = 2;
const EXIT_IO: u8 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "statecraft",
    about = "Generate a typed, durable state-machine runtime from a YAML schema",
    after_help = "Examples:\n  statecraft machines/create_workspace.yaml --out src/generated --pkg workspace_fsm"
)]
pub struct Cli {
    /// Schema file holding one or more YAML machine documents.
    pub schema: PathBuf,

    /// Directory the generated module files are written to.
    #[arg(long = "out")]
    pub out: PathBuf,

    /// Module name the caller includes the generated files under.
    #[arg(long = "pkg")]
    pub pkg: String,
}

pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    match generate_all(&cli) {
        Ok(written) => {
            for path in written {
                println!("{}", path.display());
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("statecraft: {error:#}");
            let code = if error.downcast_ref::<SchemaError>().is_some()
                || error.downcast_ref::<statecraft_codegen::CodegenError>().is_some()
            {
                EXIT_SCHEMA
            } else {
                EXIT_IO
            };
            ExitCode::from(code)
        }
    }
}

/// Reads the schema file, generates one module per document, and writes
/// `<out>/<snake(name)>_fsm.rs` for each.
pub fn generate_all(cli: &Cli) -> anyhow::Result<Vec<PathBuf>> {
    use anyhow::Context;

    let input = fs::read_to_string(&cli.schema)
        .with_context(|| format!("read schema file `{}`", cli.schema.display()))?;

    let schemas = parse_schemas(&input)?;
    if schemas.is_empty() {
        return Err(SchemaError::EmptyInput.into());
    }

    fs::create_dir_all(&cli.out)
        .with_context(|| format!("create output directory `{}`", cli.out.display()))?;

    let mut written = Vec::with_capacity(schemas.len());
    for schema in &schemas {
        validate(schema)?;
        let source = generate(schema, &cli.pkg)?;
        let path = output_path(&cli.out, &schema.name);
        fs::write(&path, source)
            .with_context(|| format!("write generated module `{}`", path.display()))?;
        info!(machine = %schema.name, path = %path.display(), "generated machine module");
        written.push(path);
    }

    Ok(written)
}

fn output_path(out: &Path, machine_name: &str) -> PathBuf {
    out.join(format!("{}_fsm.rs", names::snake_case(machine_name)))
}
