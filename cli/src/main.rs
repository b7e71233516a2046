mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stun-nat")]
#[command(about = "STUN NAT behavior discovery client and server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Query a STUN server for the public address
    Query {
        /// STUN server address (host:port or host, default port 3478)
        address: String,
    },
    /// Discover NAT mapping and filtering behavior
    Probe {
        /// STUN server to probe against
        #[arg(long, default_value = "stun.l.google.com:19302")]
        server: String,

        /// Alternative server for the mapping tests when the primary does
        /// not advertise OTHER-ADDRESS
        #[arg(long)]
        alt_server: Option<String>,

        /// Local ip:port to bind (default: auto-detected interface, port 0)
        #[arg(long)]
        local: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the STUN server
    Serve {
        /// Primary IPv4 address (auto-detected when empty)
        #[arg(long, default_value = "")]
        primary_addr: String,

        /// Alternative IPv4 address (auto-detected when empty)
        #[arg(long, default_value = "")]
        alt_addr: String,

        #[arg(long, default_value_t = stun::DEFAULT_PORT)]
        primary_port: u16,

        #[arg(long, default_value_t = stun::DEFAULT_ALT_PORT)]
        alt_port: u16,

        /// host:port of the TCP slave channel: the listen address with
        /// --slave, the slave peer to dial otherwise
        #[arg(long)]
        slave_server: Option<String>,

        /// Run as the slave holding the alternative address
        #[arg(long)]
        slave: bool,

        /// Only auto-detect public (non-RFC1918) addresses
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        public: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Query { address } => commands::query::run(&address),
        Commands::Probe {
            server,
            alt_server,
            local,
            json,
        } => commands::probe::run(&server, alt_server.as_deref(), local.as_deref(), json),
        Commands::Serve {
            primary_addr,
            alt_addr,
            primary_port,
            alt_port,
            slave_server,
            slave,
            public,
        } => {
            commands::serve::run(commands::serve::ServeArgs {
                primary_addr,
                alt_addr,
                primary_port,
                alt_port,
                slave_server,
                slave,
                public,
            })
            .await
        }
    }
}
