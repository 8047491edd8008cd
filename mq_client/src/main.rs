use std::error::Error;
use std::io::{self, BufRead, Write};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mqueue::{MessageQueue, MqAttr, OpenOptions, QueueConfig, Wait};

const TERMINATION_MSG: &[u8] = b"<TERMINATE>";

#[derive(clap::Parser)]
#[clap(version)]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "mq-client.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ClientConfig {
    queue: QueueConfig,
    server_queue: String,
    client_queue: String,
    max_messages: usize,
    max_msg_size: usize,
    mode: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            queue: QueueConfig::from_env(),
            server_queue: "sp-example-server".to_string(),
            client_queue: "sp-example-client".to_string(),
            max_messages: 10,
            max_msg_size: 256,
            mode: 0o660,
        }
    }
}

fn prompt() -> io::Result<()> {
    print!("Enter a string (Press <ENTER>): ");
    io::stdout().flush()
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ClientConfig = confy::load_path(&opts.config)?;
    cfg.queue.validate()?;

    let attr = MqAttr::new(cfg.max_messages, cfg.max_msg_size);
    let client = MessageQueue::open(
        &cfg.client_queue,
        &OpenOptions::new().create().read_only().mode(cfg.mode).attr(attr),
        &cfg.queue,
    )?;
    let server = MessageQueue::open(&cfg.server_queue, &OpenOptions::new().write_only(), &cfg.queue)?;
    info!(client = client.name(), server = server.name(), "connected");
    server.send(cfg.client_queue.as_bytes(), 1, Wait::Blocking)?;

    prompt()?;
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.is_empty() {
            prompt()?;
            continue;
        }
        if let Err(e) = server.send(line.as_bytes(), 1, Wait::Blocking) {
            warn!(error = %e, "not able to send message to server");
            continue;
        }
        let reply = client.receive(cfg.max_msg_size, Wait::Blocking)?;
        println!("Client: Message received from server: {}", String::from_utf8_lossy(&reply.payload));
        prompt()?;
    }
    println!();

    // EOF: ask the server to shut down.
    if let Err(e) = server.send(TERMINATION_MSG, 1, Wait::Blocking) {
        warn!(error = %e, "not able to send termination message to server");
    }
    server.close()?;
    client.destroy()?;
    info!("bye");
    Ok(())
}
