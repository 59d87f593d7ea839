use clap::Parser;
use rtc_session_core::config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rtc-session-core")]
#[command(author = "Selkies Team")]
#[command(version)]
#[command(about = "Loopback demo of the peer-connection session engine", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rtc-session-core.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Number of messages to send over the demo DataChannel
    #[arg(short, long, default_value = "5")]
    pub messages: usize,

    /// Label of the demo DataChannel
    #[arg(short, long, default_value = "chat")]
    pub label: String,

    /// Send binary messages instead of text
    #[arg(long, action)]
    pub binary: bool,

    /// Print a stats report for both sessions before shutting down
    #[arg(long, action)]
    pub stats: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
