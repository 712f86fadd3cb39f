use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use tokio::runtime;
use tubestore::{setup_tracing, AppError, AppResult, Broker, BrokerConfig, GLOBAL_CONFIG};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// directory of the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    // the path comes from the command line, so the config cannot be lazily initialized
    let broker_config = BrokerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", broker_config);
        return Ok(());
    }

    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _tracing_guard = setup_tracing(&commandline.log_dir, level)?;

    GLOBAL_CONFIG
        .set(broker_config.clone())
        .map_err(|_| AppError::IllegalState("broker config already set".into()))?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let broker = Broker::new(broker_config);
    broker.start(&rt)?;

    Ok(())
}
