use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mqueue::{HandleTable, MqAttr, MqError, Mqd, OpenFlags, QueueConfig};

const TERMINATION_MSG: &[u8] = b"<TERMINATE>";
const POLL: Duration = Duration::from_millis(500);

#[derive(clap::Parser)]
#[clap(version)]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "mq-server.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    queue: QueueConfig,
    server_queue: String,
    max_messages: usize,
    max_msg_size: usize,
    mode: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            queue: QueueConfig::from_env(),
            server_queue: "sp-example-server".to_string(),
            max_messages: 10,
            max_msg_size: 256,
            mode: 0o660,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ServerConfig = confy::load_path(&opts.config)?;
    cfg.queue.validate()?;

    let closing = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&closing))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&closing))?;

    let table = HandleTable::new(cfg.queue.clone());
    let attr = MqAttr::new(cfg.max_messages, cfg.max_msg_size);
    let server = table.open(&cfg.server_queue, OpenFlags::RDONLY | OpenFlags::CREAT, cfg.mode, Some(&attr))?;
    info!(
        queue = %cfg.server_queue,
        mqd = server.as_raw(),
        data_dir = %table.config().data_dir,
        "server ready"
    );

    let result = serve(&table, server, &cfg, &closing);

    if let Err(e) = table.close(server) {
        warn!(error = %e, "closing the server queue failed");
    }
    if let Err(e) = table.unlink(&cfg.server_queue) {
        warn!(error = %e, "removing the server queue failed");
    }
    info!("bye");
    result
}

/// Receives with short deadlines so that a termination signal is noticed.
fn receive(
    table: &HandleTable,
    mqd: Mqd,
    buf: &mut [u8],
    closing: &AtomicBool,
) -> Result<Option<usize>, MqError> {
    while !closing.load(Ordering::Relaxed) {
        match table.timed_receive(mqd, buf, Instant::now() + POLL) {
            Ok((len, _)) => return Ok(Some(len)),
            Err(MqError::TimedOut) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Sends with short deadlines for the same reason. `Ok(false)` means the
/// server is shutting down.
fn send(
    table: &HandleTable,
    mqd: Mqd,
    payload: &[u8],
    priority: u32,
    closing: &AtomicBool,
) -> Result<bool, MqError> {
    while !closing.load(Ordering::Relaxed) {
        match table.timed_send(mqd, payload, priority, Instant::now() + POLL) {
            Ok(()) => return Ok(true),
            Err(MqError::TimedOut) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

fn serve(table: &HandleTable, server: Mqd, cfg: &ServerConfig, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let mut in_buffer = vec![0u8; cfg.max_msg_size];

    let len = match receive(table, server, &mut in_buffer, closing)? {
        Some(len) => len,
        None => return Ok(()),
    };
    let client_name = String::from_utf8_lossy(&in_buffer[..len]).into_owned();
    info!(client = %client_name, "client queue name received");
    let client = table.open(&client_name, OpenFlags::WRONLY, 0, None)?;

    let mut token_number = 1u64;
    while let Some(len) = receive(table, server, &mut in_buffer, closing)? {
        let message = &in_buffer[..len];
        info!(message = %String::from_utf8_lossy(message), "received");
        if message == TERMINATION_MSG {
            break;
        }
        let mut reply = format!("({}) ", token_number).into_bytes();
        reply.extend_from_slice(message);
        reply.truncate(cfg.max_msg_size);
        match send(table, client, &reply, 1, closing) {
            Ok(true) => {
                info!(token = token_number, "response sent to client");
                token_number += 1;
            }
            Ok(false) => break,
            Err(e) => warn!(error = %e, "not able to send message to client"),
        }
    }
    table.close(client)?;
    Ok(())
}
