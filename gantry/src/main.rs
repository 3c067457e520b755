use std::process::ExitCode;

mod cli;
mod github;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("GANTRY_LOG", "info"))
        .format_timestamp_secs()
        .init();

    match cli::run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
