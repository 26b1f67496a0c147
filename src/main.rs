use aimq::cli::Cli;
use aimq::config::AimqConfig;
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AimqConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = aimq::tracing::init_tracing(&config) {
        eprintln!("unable to initialize tracing: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::from(cli.run(&config).await)
}
