use clap::{Parser, Subcommand};
use std::path::PathBuf;

use warden_config::{ConfigLoader, WardenConfig};
use warden_core::{Permission, WardenError};

mod run;

/// Warden: plugin isolation and capability mediation host
#[derive(Parser)]
#[command(name = "warden", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to warden.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a WebAssembly plugin in a sandbox until Ctrl-C
    Run {
        /// Path to the plugin's .wasm module
        module: PathBuf,
        /// Plugin identifier
        #[arg(long)]
        id: String,
        /// Permission to grant (repeatable), e.g. filesystem.read:/notes
        #[arg(short, long = "permission")]
        permissions: Vec<String>,
    },
    /// Show the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse permission strings and show how they are read
    Permissions {
        #[arg(required = true)]
        permissions: Vec<String>,
    },
    /// Show version and build info
    Version,
}

impl Cli {
    pub async fn run(self) -> warden_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(config.logging.level.as_str())
        };
        crate::logging::init(log_level, &config.logging.format);

        match self.command {
            Commands::Run {
                module,
                id,
                permissions,
            } => run::cmd_run(config, module, id, permissions).await,
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Permissions { permissions } => Self::cmd_permissions(&permissions),
            Commands::Version => Self::cmd_version(),
        }
    }

    fn cmd_config(config: &WardenConfig, json: bool) -> warden_core::Result<()> {
        println!("{}", render_config(config, json)?);
        Ok(())
    }

    fn cmd_permissions(inputs: &[String]) -> warden_core::Result<()> {
        for line in describe_permissions(inputs)? {
            println!("{line}");
        }
        Ok(())
    }

    fn cmd_version() -> warden_core::Result<()> {
        println!("warden v{}", env!("CARGO_PKG_VERSION"));
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        println!(
            "   WASM plugins: {}",
            if cfg!(feature = "wasm") { "enabled" } else { "disabled" }
        );
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }
}

/// Render the configuration as TOML, or pretty JSON.
pub fn render_config(config: &WardenConfig, json: bool) -> warden_core::Result<String> {
    if json {
        Ok(serde_json::to_string_pretty(config)?)
    } else {
        toml::to_string_pretty(config).map_err(|e| WardenError::Config(e.to_string()))
    }
}

/// One line per permission, failing on the first malformed string.
pub fn describe_permissions(inputs: &[String]) -> warden_core::Result<Vec<String>> {
    inputs
        .iter()
        .map(|input| {
            let p = Permission::parse(input)?;
            Ok(format!(
                "{:<32} category={} action={} scope={}",
                p.to_string(),
                p.category.as_str(),
                p.action,
                p.scope.as_deref().unwrap_or("*")
            ))
        })
        .collect()
}
