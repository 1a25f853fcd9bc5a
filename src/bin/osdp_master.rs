//! Poll the OSDP bus described by a configuration file and bridge it to stdin/stdout.
//!
//! Input lines:
//! ```text
//! <addr> <hex bytes>   queue a command, function code first
//! <addr> enable
//! <addr> disable
//! ```
//! Output lines:
//! ```text
//! <addr> reply <function code> <hex bytes>
//! <addr> status ONLINE|OFFLINE|DISABLED [<identifier>]
//! ```
//! The identifier is printed for devices configured with a `uid`.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{ensure, Context, Result};
use log::{info, warn};

use osdp_master::bridge::Bridge;
use osdp_master::link::SerialConnector;
use osdp_master::{Address, BusHandle, Config, Master, Status};

const DEFAULT_CONFIG: &str = "/etc/osdp-master.toml";

struct StdoutBridge {
    out: io::Stdout,
}

impl Bridge for StdoutBridge {
    fn reply(&mut self, address: Address, function: u8, data: &[u8]) {
        let mut out = self.out.lock();
        let _ = writeln!(out, "{} reply {:02X} {}", address, function, hex::encode(data));
        let _ = out.flush();
    }

    fn status(&mut self, address: Address, identifier: Option<&[u8; 16]>, status: Status) {
        let mut out = self.out.lock();
        let _ = match identifier {
            Some(uid) => writeln!(out, "{} status {} {}", address, status, hex::encode(uid)),
            None => writeln!(out, "{} status {}", address, status),
        };
        let _ = out.flush();
    }
}

enum Command {
    Send(Address, Vec<u8>),
    SetEnabled(Address, bool),
}

fn parse_command(line: &str) -> Result<Command> {
    let mut words = line.split_whitespace();
    let address: u8 = words
        .next()
        .context("Missing address")?
        .parse()
        .context("Address is not a number")?;
    let address = Address::new(address)?;
    let rest: Vec<&str> = words.collect();
    Ok(match rest.as_slice() {
        ["enable"] => Command::SetEnabled(address, true),
        ["disable"] => Command::SetEnabled(address, false),
        hex_words => {
            let payload = hex::decode(hex_words.concat()).context("Payload is not hex")?;
            ensure!(!payload.is_empty(), "Empty payload");
            Command::Send(address, payload)
        }
    })
}

fn intake(handle: BusHandle) -> Result<()> {
    for line in io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let result = parse_command(&line).and_then(|command| {
            match command {
                Command::Send(address, payload) => handle.deliver(address, payload)?,
                Command::SetEnabled(address, enabled) => handle.set_enabled(address, enabled)?,
            }
            Ok(())
        });
        if let Err(err) = result {
            warn!("Ignoring {:?}: {:#}", line, err);
        }
    }
    info!("stdin closed, no more commands");
    Ok(())
}

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = Config::load(&path).with_context(|| format!("Failed to load {}", path))?;

    env_logger::Builder::new()
        .filter_level(config.logging.filter())
        .parse_env(env_logger::Env::default())
        .init();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("Failed to install the interrupt handler")?;
    }

    let bridge = StdoutBridge { out: io::stdout() };
    let mut master = Master::new(config.devices()?, config.poll.clone(), bridge);
    let handle = master.handle();
    thread::spawn(move || {
        if let Err(err) = intake(handle) {
            warn!("{:#}", err);
        }
    });

    info!("polling {} device(s) on {}", master.registry().len(), config.port.device);
    master.run(&mut SerialConnector, &config.port, &stop);

    let counters = master.counters();
    info!(
        "stopped: {} checksum errors, {} timeouts",
        counters.crc(),
        counters.timeouts()
    );
    Ok(())
}
