use std::fs::File;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use tracing::{info, warn, Level};

use dccnet::config::LinkConfig;
use dccnet::connection::Connection;
use dccnet::xfer;

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    role: Role,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Role {
    /// wait for one peer to connect, then exchange files with it
    Server {
        port: u16,
        input: PathBuf,
        output: PathBuf,

        /// listen on IPv6 instead of IPv4
        #[clap(long, default_value_t = false)]
        ipv6: bool,
    },
    /// connect to a listening peer and exchange files with it
    Client {
        /// peer address as host:port
        server: String,
        input: PathBuf,
        output: PathBuf,
    },
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

    let (stream, input, output) = match &args.role {
        Role::Server { port, input, output, ipv6 } => (accept_one(*port, *ipv6)?, input, output),
        Role::Client { server, input, output } => (connect(server)?, input, output),
    };

    let mut input_file =
        File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let output_file =
        File::create(output).with_context(|| format!("creating {}", output.display()))?;

    let conn = Connection::new(stream, LinkConfig::default())?;
    let report = xfer::run_session(conn, &mut input_file, output_file)?;

    info!("done: {} bytes sent, {} bytes received", report.bytes_sent, report.bytes_received);
    Ok(())
}

fn accept_one(port: u16, ipv6: bool) -> anyhow::Result<TcpStream> {
    let bind_addr =
        if ipv6 { format!("[::]:{}", port) } else { format!("0.0.0.0:{}", port) };
    let listener =
        TcpListener::bind(&bind_addr).with_context(|| format!("binding {}", bind_addr))?;
    info!("listening on {}", bind_addr);
    let (stream, peer) = listener.accept().context("accepting a connection")?;
    info!("accepted connection from {}", peer);
    Ok(stream)
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
