use clap::{Args, Parser, Subcommand, ValueEnum};

use gale::config::Config;
use gale::serve::{serve_http, serve_sse, serve_stdio};
use gale::server::OsServer;

#[derive(Parser)]
#[command(name = "gale")]
#[command(about = "MCP server exposing controlled OS capabilities")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the command execution and process management tools
    CommandServer(ServeArgs),
    /// Serve the filesystem tools
    FilesystemServer(ServeArgs),
    /// Serve both tool families from one endpoint
    UnifiedServer(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Transport to serve on
    #[arg(long, value_enum, default_value_t = Mode::Stdio)]
    mode: Mode,
    /// Bind host for sse/http modes
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Bind port for sse/http modes
    #[arg(long, default_value_t = 8120)]
    port: u16,
    /// URL path prefix for sse/http endpoints
    #[arg(long, default_value = "")]
    prefix: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Stdio,
    Sse,
    Http,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_env();

    let (server, args) = match cli.command {
        Commands::CommandServer(args) => (OsServer::command_server(config), args),
        Commands::FilesystemServer(args) => (OsServer::filesystem_server(config), args),
        Commands::UnifiedServer(args) => (OsServer::unified_server(config), args),
    };
    tracing::info!(server = server.flavor().name(), "gale starting");

    match args.mode {
        Mode::Stdio => serve_stdio(server).await?,
        Mode::Sse => serve_sse(server, &args.host, args.port, &args.prefix).await?,
        Mode::Http => serve_http(server, &args.host, args.port, &args.prefix).await?,
    }

    tracing::info!("gale shutting down");
    Ok(())
}
