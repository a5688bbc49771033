//! blerelay-ctl — command-line interface for the blerelay daemon.

mod cmd;

use anyhow::{Context, Result};

use cmd::devices::{cmd_devices, cmd_probe};
use cmd::sessions::cmd_sessions;
use cmd::status::{cmd_proxies, cmd_status};

const DEFAULT_PORT: u16 = 8081;

fn print_usage() {
    eprintln!("Usage: blerelay-ctl [--port N] <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status        Relay summary");
    eprintln!("  devices       Devices currently in range");
    eprintln!("  proxies       Known Bluetooth proxies");
    eprintln!("  sessions      Active client sessions");
    eprintln!("  probe <MAC>   Retrieve a device's service and characteristic UUIDs");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | []                => cmd_status(port).await,
        ["devices"]                    => cmd_devices(port).await,
        ["proxies"]                    => cmd_proxies(port).await,
        ["sessions"]                   => cmd_sessions(port).await,
        ["probe", mac]                 => cmd_probe(port, mac).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
