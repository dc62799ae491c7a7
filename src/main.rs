use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use kingress::{
    GracefulShutdown, HttpClientAdapter, IngressController, KubeCluster, MemorySessionStore,
    config::{ControllerConfig, ControllerConfigValidator, load_config},
    default_plugins, metrics, tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file (YAML, JSON or TOML); `KINGRESS_*` variables
    /// override its values
    #[clap(short, long, global = true, env = "KINGRESS_CONFIG")]
    config: Option<String>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Run the controller (default)
    Serve,
    /// Validate the configuration and print a summary
    Validate,
    /// Write a configuration file with every default spelled out
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "kingress.json")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(args.config.as_deref()).await,
        Commands::Validate => validate_config_command(args.config.as_deref()),
        Commands::Init { output } => init_config_command(&output).await,
    }
}

async fn serve(config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    tracing_setup::init_tracing(&config.logging)?;
    ControllerConfigValidator::validate(&config).wrap_err("Invalid configuration")?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already.",
            e
        );
    }

    metrics::init_metrics()?;

    let cluster = KubeCluster::try_default(&config.cluster)
        .await
        .wrap_err("Failed to connect to the Kubernetes API")?;

    let controller = IngressController::new(
        config.clone(),
        Arc::new(cluster),
        Arc::new(MemorySessionStore::new()),
        Arc::new(HttpClientAdapter::new()),
        default_plugins(&config),
    );
    controller.initialize().await?;
    tracing::info!(
        metrics = ?metrics::get_current_metrics(),
        "Initial routing table published"
    );

    controller.run(Arc::new(GracefulShutdown::new())).await
}

/// Validate configuration and exit
fn validate_config_command(config_path: Option<&str>) -> Result<()> {
    match config_path {
        Some(path) => println!("🔍 Validating configuration file: {path}"),
        None => println!("🔍 Validating configuration from defaults and environment"),
    }

    if let Some(path) = config_path {
        if !Path::new(path).exists() {
            eprintln!("❌ Error: Configuration file '{path}' not found");
            std::process::exit(1);
        }
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ControllerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            print_summary(&config);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Listen addresses are 'IP:PORT' (e.g. '0.0.0.0:443')");
            println!("   • Durations use humantime units (e.g. '1s', '250ms', '1h')");
            println!("   • Dummy hosts are bare hostnames without scheme or port");
            std::process::exit(1);
        }
    }
}

fn print_summary(config: &ControllerConfig) {
    println!("📋 Configuration Summary:");
    println!("   • HTTP Listener: {}", config.http_addr);
    println!("   • HTTPS Listener: {}", config.https_addr);
    println!("   • Ingress Class: {}", config.cluster.ingress_class);
    println!(
        "   • Status Service: {}",
        config.cluster.service_name.as_deref().map_or_else(
            || "none".to_string(),
            |name| format!("{}/{name}", config.cluster.namespace)
        )
    );
    println!(
        "   • Reconcile Interval: {}",
        humantime::format_duration(config.reconcile.interval)
    );
    println!(
        "   • Proxy Timeout: {}",
        humantime::format_duration(config.proxy.timeout)
    );
    println!("   • Dummy Hosts: {}", config.dummy_hosts.len());
    println!("   • Plugins: {:?}", default_plugins(config).names());
}

/// Write the default configuration to a new file
async fn init_config_command(output: &str) -> Result<()> {
    let path = Path::new(output);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{output}' already exists");
        std::process::exit(1);
    }

    let contents = serde_json::to_string_pretty(&ControllerConfig::default())
        .map_err(|e| eyre!("Failed to render default configuration: {e}"))?;
    tokio::fs::write(path, contents + "\n")
        .await
        .context("Failed to write config file")?;

    println!("✅ Created default configuration at: {output}");
    println!("   Run 'kingress serve --config {output}' to start the controller");
    Ok(())
}
