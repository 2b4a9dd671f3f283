//! Main entry point for the Kisan advisor CLI.

use anyhow::{bail, Context, Result};
use clap::Parser;
use kisan_advisor::{
    auth::AuthManager,
    cli::{self, Commands},
    server,
    settings::Settings,
    telemetry, Media, Orchestrator, Query,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let mut settings = Settings::load()?;
    telemetry::init(&settings.logging)?;

    match args.command {
        Commands::Serve { addr } => server::serve(settings, addr).await,
        Commands::Ask { text, image, strategy } => {
            if let Some(strategy) = strategy {
                settings.orchestrator.strategy = strategy;
                settings.strategy()?;
            }
            let mut query = Query { text, media: None };
            if let Some(path) = image {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read image {:?}", path))?;
                let mime = mime_guess::from_path(&path).first_or(mime_guess::mime::IMAGE_JPEG);
                query = query.with_media(Media::new(mime.essence_str(), data));
            }
            if query.is_empty() {
                bail!("Provide --text, --image or both");
            }

            let orchestrator = Orchestrator::new(&settings)?;
            let answer = orchestrator.handle(query).await?;
            println!("{}", answer);
            Ok(())
        }
        Commands::Token { user } => {
            let auth = AuthManager::from_config(&settings.security)?;
            println!("{}", auth.issue_token(&user)?);
            Ok(())
        }
    }
}
