//! # rkv-monitor
//!
//! Prints every command the server executes, one parsed event per line.
//!
//! Usage: `rkv-monitor [config.json]`

use std::sync::Arc;

use anyhow::{Context, Result};
use rkv_client::{MonitorConnection, MonitorEvent, MonitorListener, RkvError};
use tracing::{error, info, warn};

struct Printer;

impl MonitorListener for Printer {
    fn on_event(&self, event: &MonitorEvent) {
        println!("{}", event);
    }

    fn on_parse_error(&self, line: &str, err: &RkvError) {
        warn!(line = %line, error = %err, "skipping unparsable monitor line");
    }

    fn on_error(&self, err: &RkvError) {
        error!(error = %err, "monitor feed failed");
    }
}

fn main() {
    rkv_tools::init_tracing();
    if let Err(err) = run() {
        eprintln!("rkv-monitor failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let (endpoint, _) = rkv_tools::endpoint_from_args(std::env::args().skip(1).collect())?;
    let monitor = MonitorConnection::open(Arc::new(endpoint.clone()))
        .with_context(|| format!("starting monitor on {}", endpoint))?;
    monitor.add_listener(Arc::new(Printer));
    info!(endpoint = %endpoint, "monitoring");

    rkv_tools::wait_while(|| monitor.is_running());
    info!("monitor feed ended");
    Ok(())
}
