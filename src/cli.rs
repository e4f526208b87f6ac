use clap::{Parser, Subcommand};
use std::path::PathBuf;
use anyhow::Result;

use crate::core::Engine;

#[derive(Parser)]
#[command(name = "faultline")]
#[command(about = "Static discovery of FastAPI error responses for OpenAPI schemas")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile an augmented OpenAPI artifact from a FastAPI application
    Compile {
        /// Application reference in the form module.path:attribute
        app_ref: String,

        /// Path the compiled artifact is written to (defaults to openapi.json)
        target: Option<PathBuf>,

        /// Source root of the analyzed service
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Existing OpenAPI description to augment instead of a synthesized baseline
        #[arg(long)]
        openapi: Option<PathBuf>,

        /// Additional module prefixes to search for raised errors
        #[arg(short, long)]
        modules: Vec<String>,
    },

    /// List discovered routes, dependency chains and resolved responses
    Routes {
        /// Application reference in the form module.path:attribute
        app_ref: String,

        /// Source root of the analyzed service
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Additional module prefixes to search for raised errors
        #[arg(short, long)]
        modules: Vec<String>,
    },
}

impl Cli {
    pub async fn execute(self, mut engine: Engine) -> Result<()> {
        match self.command {
            Commands::Compile { app_ref, target, source, openapi, modules } => {
                engine.compile(&app_ref, target, source, openapi, modules).await
            }
            Commands::Routes { app_ref, source, modules } => {
                engine.routes(&app_ref, source, modules).await
            }
        }
    }
}
