use log::{error, info};

use tqdbproxy::app;
use tqdbproxy::config;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = app::parse();
    app::init_logging(&args);

    // The config loader is async; parse it on a throwaway runtime
    // before the real one spins up with the configured thread count.
    let loader = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build config loader runtime");
    if let Err(err) = loader.block_on(config::parse(&args.config_file)) {
        error!("config error: {err}");
        std::process::exit(exitcode::CONFIG);
    }
    drop(loader);

    let config = config::get_config();
    config.show();

    if args.test_config {
        info!("config ok");
        std::process::exit(exitcode::OK);
    }

    if let Err(err) = app::run_server(config) {
        error!("fatal: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }

    std::process::exit(exitcode::OK);
}
