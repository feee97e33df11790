use std::sync::Arc;

use clap::Parser;

use cachebeam::logger::Logger;
use cachebeam::proxy::Proxy;

/// Command-line configuration: the listening port is the one required
/// argument, with optional overrides for where the lifecycle log goes and
/// how many responses the cache may hold.
#[derive(Parser, Debug)]
#[command(about = "Fun with HTTP caching")]
struct CmdOptions {
    /// Port to listen on for client connections
    port: u16,
    /// File the request lifecycle log is written to
    #[arg(long, default_value = "proxy.log")]
    log_file: String,
    /// Maximum number of responses held in the cache
    #[arg(long, default_value = "50")]
    max_cache_entries: usize,
}

fn main() {
    // diagnostic logging goes to stderr; the lifecycle event log is a
    // separate file opened below.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let options = CmdOptions::parse();

    let logger = match Logger::open(&options.log_file) {
        Ok(logger) => logger,
        Err(err) => {
            log::error!("could not open log file {}: {}", options.log_file, err);
            std::process::exit(1);
        }
    };

    let proxy = match Proxy::new(options.port, options.max_cache_entries, logger) {
        Ok(proxy) => Arc::new(proxy),
        Err(err) => {
            log::error!("could not start proxy on port {}: {}", options.port, err);
            std::process::exit(1);
        }
    };

    // a SIGINT flips the running flag; the accept loop notices within a poll
    // interval and drains its workers before returning.
    {
        let proxy = Arc::clone(&proxy);
        if let Err(err) = ctrlc::set_handler(move || {
            log::info!("received termination signal, shutting down");
            proxy.stop();
        }) {
            log::error!("could not install signal handler: {}", err);
            std::process::exit(1);
        }
    }

    log::info!("listening for requests on port {}", options.port);
    proxy.run();
    log::info!("proxy stopped");
}
