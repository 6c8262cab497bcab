use std::env;

use humble_vault::AppConfig;

#[tokio::main]
async fn main() -> humble_vault::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();

    #[cfg(feature = "cli")]
    {
        use humble_vault::cli::{Command, parse_args, print_usage};

        let command = match parse_args(&args) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("Error: {e}");
                eprintln!();
                print_usage();
                std::process::exit(2);
            }
        };

        let config = AppConfig::load()?;
        match command {
            Command::Help => {
                print_usage();
                Ok(())
            }
            Command::Serve => serve(config).await,
            other => humble_vault::cli::run(other, config).await,
        }
    }
    #[cfg(not(feature = "cli"))]
    {
        if args.first().is_some_and(|a| a != "serve") {
            eprintln!("CLI support not compiled in; only 'serve' is available");
            std::process::exit(1);
        }
        serve(AppConfig::load()?).await
    }
}

async fn serve(config: AppConfig) -> humble_vault::Result<()> {
    #[cfg(feature = "server")]
    {
        humble_vault::server::run_standalone(config).await
    }
    #[cfg(not(feature = "server"))]
    {
        let _ = config;
        eprintln!("API server support not compiled in");
        std::process::exit(1);
    }
}
