extern crate log;

use tracing_subscriber::EnvFilter;

use super::args::{Args, LogFormat};
use crate::config::VERSION;

pub fn init_logging(args: &Args) {
    use log::info;

    // Initialize a default filter, then override the builtin default
    // "warning" with our commandline (default: "info").
    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());

    let trace_sub = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!args.no_color);

    match args.log_format {
        LogFormat::Structured => trace_sub.json().init(),
        LogFormat::Debug => trace_sub.pretty().init(),
        LogFormat::Text => trace_sub.init(),
    };

    info!("Welcome to tqdbproxy! (Version {VERSION})");
}
