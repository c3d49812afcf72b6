use crate::config::ProxyConfig;
use clap::Parser;
use std::path::PathBuf;

/// Define the application arguments
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Chrome DevTools endpoint (ws:// debugger URL or http://host:port)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Record response snapshots of every request to a file
    #[arg(long)]
    pub record: Option<PathBuf>,
}

impl Args {
    /// CLI flags override file and environment settings.
    pub fn apply_to(&self, config: &mut ProxyConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(endpoint) = &self.endpoint {
            config.browser.endpoint = endpoint.clone();
        }
        if let Some(record) = &self.record {
            config.recording.path = Some(record.clone());
        }
    }
}
