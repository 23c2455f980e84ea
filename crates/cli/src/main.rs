use std::process::ExitCode;

fn main() -> ExitCode {
    insureflow_cli::run()
}
