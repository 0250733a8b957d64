use std::fs::File;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, warn, Level};

use dccnet::config::LinkConfig;
use dccnet::connection::Connection;
use dccnet::relay;

#[derive(Parser)]
struct Args {
    /// server address as host:port
    server: String,

    /// authentication token presented to the server
    gas: String,

    /// write received lines to this file instead of stdout
    #[clap(short, long)]
    output: Option<PathBuf>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let stream = connect(&args.server)?;
    let conn = Connection::new(stream, LinkConfig::default())?;

    let report = match &args.output {
        Some(path) => {
            let mut out =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            relay::run_session(conn, &args.gas, &mut out)?
        }
        None => relay::run_session(conn, &args.gas, &mut io::stdout())?,
    };

    info!("done: {} lines hashed", report.lines);
    Ok(())
}

fn connect(server: &str) -> anyhow::Result<TcpStream> {
    let addrs = server
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", server))?;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                info!("connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => warn!("connecting to {} failed: {}", addr, e),
        }
    }
    bail!("could not connect to {}", server)
}
