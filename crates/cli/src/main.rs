use std::process::ExitCode;

fn main() -> ExitCode {
    statecraft_cli::run()
}
