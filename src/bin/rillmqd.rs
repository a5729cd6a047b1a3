//! rillmqd – one binary that can start the broker *or* act as an
//! interactive V2 client shell.
//
//  $ rillmqd start --config rillmq.toml
//  $ rillmqd connect 127.0.0.1:4150
//  > sub orders billing
//  > rdy 1
//  > pub orders hello
//  < 0a1b2c3d4e5f6071 attempts=1 hello
use rillmq::broker::protocol::frame::{try_decode_frame, FrameType, HEARTBEAT, MAGIC_V2};
use rillmq::core::message::Message;
use rillmq::logging::init_logging;
use rillmq::{Daemon, Options};

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use clap::{Parser, Subcommand};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "rillmqd", version, about = "RillMQ broker & CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker daemon.
    Start {
        /// Path to config TOML (env RILLMQ_CONFIG is used when absent)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// TCP address for V2 clients
        #[arg(long)]
        tcp_address: Option<String>,
        /// Directory for backing queues and metadata
        #[arg(long)]
        data_path: Option<PathBuf>,
        /// Default log directive when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Connect to a running broker in interactive mode.
    Connect {
        /// Broker address (host:port)
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start {
            config,
            tcp_address,
            data_path,
            log_level,
        } => {
            let mut options = Options::load(config.as_deref()).context("loading configuration")?;
            if let Some(addr) = tcp_address {
                options.tcp_address = addr;
            }
            if let Some(path) = data_path {
                options.data_path = path;
            }
            if log_level.is_some() {
                options.log_level = log_level;
            }
            init_logging(options.log_level.as_deref());
            start(options).await?;
        }
        Command::Connect { addr } => {
            init_logging(Some("warn"));
            repl(addr).await?;
        }
    }
    Ok(())
}

async fn start(options: Options) -> anyhow::Result<()> {
    let daemon = Daemon::new(options)?;
    daemon.load_metadata()?;
    let addr = daemon.run().await?;
    println!("RillMQ broker listening on {addr}");

    wait_for_signal().await?;
    info!(target: "rillmq::daemon", "signal received");
    daemon.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for SIGINT")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")
}

// ───────────────────────────────────────────────────────────
// Interactive REPL shell
// ───────────────────────────────────────────────────────────

fn command_line(words: &[&str]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(words.join(" ").as_bytes());
    buf.put_u8(b'\n');
    buf
}

fn command_with_body(words: &[&str], body: &[u8]) -> BytesMut {
    let mut buf = command_line(words);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf
}

async fn send(writer: &Mutex<OwnedWriteHalf>, data: &[u8]) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(data).await?;
    w.flush().await
}

async fn repl(addr: SocketAddr) -> anyhow::Result<()> {
    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;

    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let (mut reader, w) = stream.into_split();
    let writer = Arc::new(Mutex::new(w));
    send(&writer, MAGIC_V2).await?;

    println!("Connected to {addr}. Type `help` for commands.");

    // Prints every frame and answers heartbeats.
    let printer_writer = Arc::clone(&writer);
    let printer: JoinHandle<()> = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            loop {
                let frame = match try_decode_frame(&mut buf) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        println!("! bad frame: {e}");
                        return;
                    }
                };
                match frame.frame_type {
                    FrameType::Response if &frame.data[..] == HEARTBEAT => {
                        if send(&printer_writer, b"NOP\n").await.is_err() {
                            return;
                        }
                    }
                    FrameType::Response => {
                        println!("< {}", String::from_utf8_lossy(&frame.data));
                    }
                    FrameType::Error => {
                        println!("! {}", String::from_utf8_lossy(&frame.data));
                    }
                    FrameType::Message => match Message::decode(frame.data) {
                        Ok(msg) => println!(
                            "< {} attempts={} {}",
                            msg.id(),
                            msg.attempts(),
                            String::from_utf8_lossy(msg.body())
                        ),
                        Err(e) => println!("! failed to decode message: {e}"),
                    },
                }
            }
        }
        println!("connection closed");
    });

    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());

        let request = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["help"] => {
                println!(
                    "sub <topic> <channel> | pub <topic> <msg> | rdy <n> | fin <id> | \
                     req <id> <ms> | touch <id> | nop | cls | exit"
                );
                continue;
            }
            ["exit" | "quit"] => break,
            ["pub", topic, rest @ ..] if !rest.is_empty() => {
                command_with_body(&["PUB", topic], rest.join(" ").as_bytes())
            }
            ["sub", topic, channel] => command_line(&["SUB", topic, channel]),
            ["rdy", n] => command_line(&["RDY", n]),
            ["fin", id] => command_line(&["FIN", id]),
            ["req", id, ms] => command_line(&["REQ", id, ms]),
            ["touch", id] => command_line(&["TOUCH", id]),
            ["nop"] => command_line(&["NOP"]),
            ["cls"] => command_line(&["CLS"]),
            _ => {
                println!("Unknown cmd. Type `help`.");
                continue;
            }
        };
        if let Err(e) = send(&writer, &request).await {
            println!("! write failed: {e}");
            break;
        }
    }

    if let Err(e) = writer.lock().await.shutdown().await {
        println!("! shutdown failed: {e}");
    }
    printer.abort();
    let _ = printer.await;
    Ok(())
}
