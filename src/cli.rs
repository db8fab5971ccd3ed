use clap::{Parser, Subcommand};

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "jarvet", version, about = "Jarvet assistant terminal front end")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Run the interactive front end")]
    Run {
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value_t = AppConfig::default_host())]
        host: String,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        secure: bool,
        #[arg(long, default_value_t = 3000)]
        retry_ms: u64,
        #[arg(long, default_value_t = 10_000)]
        connect_timeout_ms: u64,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        no_speaker: bool,
    },
    #[command(about = "Send one text command, print the formatted result, exit")]
    Ask {
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value_t = AppConfig::default_host())]
        host: String,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        secure: bool,
        #[arg(long, default_value_t = 30)]
        timeout_s: u64,
        text: String,
    },
    #[command(about = "List synthesis voices and mark the one the ranking picks")]
    Voices,
}
