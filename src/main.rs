use anyhow::Result;
use clap::Parser;
use rustphone::app::AppBuilder;
use rustphone::config::{Cli, Config};
use std::fs::File;
use tracing::{error, info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli.conf) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration {}: {:#}", cli.conf, e);
            std::process::exit(1);
        }
    };

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _guard = guard;
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    let app = match AppBuilder::new()
        .config(config)
        .config_path(&cli.conf)
        .database_url(cli.db)
        .mock_hardware(cli.mock_hardware)
        .build()
        .await
    {
        Ok(app) => app,
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    info!("rustphone started");
    app.run().await?;
    Ok(())
}
