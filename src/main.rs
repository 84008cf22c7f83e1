use clap::Parser;

fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = app_lib::Cli::parse();
    if let Err(e) = app_lib::run(cli) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
