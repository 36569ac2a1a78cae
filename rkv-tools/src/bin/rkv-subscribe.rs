//! # rkv-subscribe
//!
//! Subscribes to channels and prints every pub/sub event. Names containing
//! `*`, `?` or `[` are subscribed as patterns.
//!
//! Usage: `rkv-subscribe [config.json] <channel>...`

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rkv_client::{RkvError, SubscriptionConnection, SubscriptionListener};
use tracing::{error, info};

struct Printer;

impl SubscriptionListener for Printer {
    fn on_subscribe(&self, channel: &str, count: i64) {
        info!(channel = %channel, count, "subscribed");
    }

    fn on_unsubscribe(&self, channel: &str, count: i64) {
        info!(channel = %channel, count, "unsubscribed");
    }

    fn on_psubscribe(&self, pattern: &str, count: i64) {
        info!(pattern = %pattern, count, "pattern subscribed");
    }

    fn on_punsubscribe(&self, pattern: &str, count: i64) {
        info!(pattern = %pattern, count, "pattern unsubscribed");
    }

    fn on_message(&self, channel: &str, payload: &[u8]) {
        println!("{} {}", channel, String::from_utf8_lossy(payload));
    }

    fn on_pmessage(&self, pattern: &str, channel: &str, payload: &[u8]) {
        println!("{} ({}) {}", channel, pattern, String::from_utf8_lossy(payload));
    }

    fn on_error(&self, err: &RkvError) {
        error!(error = %err, "subscription error");
    }
}

fn is_pattern(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

fn main() {
    rkv_tools::init_tracing();
    if let Err(err) = run() {
        eprintln!("rkv-subscribe failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let (endpoint, names) = rkv_tools::endpoint_from_args(std::env::args().skip(1).collect())?;
    if names.is_empty() {
        bail!("usage: rkv-subscribe [config.json] <channel>...");
    }
    let (patterns, channels): (Vec<String>, Vec<String>) =
        names.into_iter().partition(|name| is_pattern(name));

    let sub = SubscriptionConnection::open(Arc::new(endpoint.clone()))
        .with_context(|| format!("connecting to {}", endpoint))?;
    sub.add_listener(Arc::new(Printer));
    if !channels.is_empty() {
        sub.subscribe(&channels)?;
    }
    if !patterns.is_empty() {
        sub.psubscribe(&patterns)?;
    }

    rkv_tools::wait_while(|| sub.is_running());
    info!("subscription feed ended");
    Ok(())
}
