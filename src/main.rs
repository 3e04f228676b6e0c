// ABOUTME: pulse command-line binary
// ABOUTME: Queries the in-process sound server and prints records as JSON or text

use clap::{Parser, Subcommand};
use pulsebridge::cli::ClientArgs;
use pulsebridge::{Connection, Filter, LoopbackServer};

#[derive(Parser, Debug)]
#[command(name = "pulse")]
#[command(author, version, about = "Query a sound server", long_about = None)]
struct Args {
    #[command(flatten)]
    client: ClientArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show server information
    Info,
    /// List sinks
    Sinks {
        /// Filters of the form field/op:value, e.g. name/contains:analog
        filters: Vec<String>,
    },
    /// List sources
    Sources {
        /// Filters of the form field/op:value
        filters: Vec<String>,
    },
    /// List connected clients
    Clients {
        /// Filters of the form field/op:value
        filters: Vec<String>,
    },
    /// List loaded modules
    Modules {
        /// Filters of the form field/op:value
        filters: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    args.client.init_tracing();

    let config = args.client.build_config();
    tracing::debug!("Connecting as '{}' (timeout {:?})", config.name, config.operation_timeout);

    let server = LoopbackServer::new();
    let conn = Connection::connect(&server, config)?;
    let format = args.client.format;

    let output = match &args.command {
        Command::Info => format.render_one(&conn.server_info()?),
        Command::Sinks { filters } => format.render_list(&conn.sinks(&Filter::new(filters))?),
        Command::Sources { filters } => format.render_list(&conn.sources(&Filter::new(filters))?),
        Command::Clients { filters } => format.render_list(&conn.clients(&Filter::new(filters))?),
        Command::Modules { filters } => format.render_list(&conn.modules(&Filter::new(filters))?),
    };
    conn.disconnect();

    println!("{}", output?);
    Ok(())
}
