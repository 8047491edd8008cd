use std::error::Error;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mqueue::{MessageQueue, MqAttr, MqError, OpenOptions, QueueConfig, Wait};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "mq-bench.toml")]
    config: String,
    #[clap(short = 'n', long = "messages", default_value = "1000000")]
    messages: u64,
    /// Check that every message arrives once and in order.
    #[clap(long)]
    verify: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    queue: QueueConfig,
    bench_queue: String,
    max_messages: usize,
    max_msg_size: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            queue: QueueConfig::from_env(),
            bench_queue: "mq-bench".to_string(),
            max_messages: 1024,
            max_msg_size: 64,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    cfg.queue.validate()?;
    info!(queue = %cfg.bench_queue, messages = opts.messages, "starting benchmark");

    let attr = MqAttr::new(cfg.max_messages, cfg.max_msg_size);
    let rx = MessageQueue::open(
        &cfg.bench_queue,
        &OpenOptions::new().create().read_only().attr(attr),
        &cfg.queue,
    )?;

    info!(queue = rx.name(), id = %rx.id(), "bench queue ready");
    let start = Instant::now();
    let writer = {
        let queue_cfg = cfg.queue.clone();
        let name = cfg.bench_queue.clone();
        let total = opts.messages;
        thread::spawn(move || -> Result<(), MqError> {
            let tx = MessageQueue::open(&name, &OpenOptions::new().write_only(), &queue_cfg)?;
            for n in 0..total {
                tx.send(&n.to_le_bytes(), 0, Wait::Blocking)?;
            }
            tx.close()
        })
    };

    let mut buff = vec![0u8; cfg.max_msg_size];
    let mut mismatches = 0u64;
    for n in 0..opts.messages {
        let (len, _) = rx.receive_into(&mut buff, Wait::Blocking)?;
        if opts.verify {
            let mut raw = [0u8; 8];
            if len == raw.len() {
                raw.copy_from_slice(&buff[..len]);
            }
            if len != raw.len() || u64::from_le_bytes(raw) != n {
                mismatches += 1;
            }
        }
        if n % 100_000 == 0 {
            eprint!("\rTotal {} ops", n);
        }
    }
    let duration = start.elapsed();
    match writer.join() {
        Ok(result) => result?,
        Err(_) => return Err("writer thread panicked".into()),
    }

    let iops = ((opts.messages as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    rx.destroy()?;

    if opts.verify {
        if mismatches > 0 {
            return Err(format!("{} messages arrived out of order", mismatches).into());
        }
        println!("All {} messages verified.", opts.messages);
    }
    Ok(())
}
