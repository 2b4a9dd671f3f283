//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Kisan agricultural advisor CLI
#[derive(Parser)]
#[command(name = "kisan-cli")]
#[command(about = "Multi-agent advisory service for farmers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to; defaults to server.host and server.port
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Answer a single question and print the result
    Ask {
        /// The farmer's question
        #[arg(short, long)]
        text: Option<String>,

        /// Crop photo to attach
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Override orchestrator.strategy for this run
        #[arg(short, long)]
        strategy: Option<String>,
    },
    /// Issue a bearer token for a user
    Token {
        #[arg(short, long)]
        user: String,
    },
}
