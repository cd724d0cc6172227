use clap::{Parser, ValueEnum};
use std::fmt;
use tracing::Level;

/// tqdbproxy: a transparent batching and caching database proxy.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(default_value_t = String::from("tqdbproxy.toml"), env)]
    pub config_file: String,

    #[arg(short, long, default_value_t = tracing::Level::INFO, env)]
    pub log_level: Level,

    #[clap(short = 'F', long, value_enum, default_value_t = LogFormat::Text, env)]
    pub log_format: LogFormat,

    #[arg(
        short,
        long,
        default_value_t = false,
        env,
        help = "disable colors in the log output"
    )]
    pub no_color: bool,

    #[arg(
        short = 't',
        long = "test-config",
        default_value_t = false,
        help = "test configuration file and exit"
    )]
    pub test_config: bool,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum LogFormat {
    Text,
    Structured,
    Debug,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Structured => write!(f, "structured"),
            LogFormat::Debug => write!(f, "debug"),
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}
