//! nats - command-line client for NATS-style servers
//!
//! Publish, subscribe, send requests and answer them from the shell.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use nats_client::{Connection, Error as ClientError, HeaderMap, Message};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{CliConfig, Overrides};

/// How often blocking loops look at the shutdown flag
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// nats - publish/subscribe messaging from the command line
#[derive(Parser)]
#[command(name = "nats")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server URL (comma-separated for a cluster)
    #[arg(short, long, global = true, env = "NATS_URL")]
    server: Option<String>,

    /// Configuration file path
    #[arg(short, long, global = true, env = "NATS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Connection name reported to the server
    #[arg(long, global = true, env = "NATS_NAME")]
    name: Option<String>,

    /// User name
    #[arg(long, global = true, env = "NATS_USER")]
    user: Option<String>,

    /// Password
    #[arg(long, global = true, env = "NATS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Auth token
    #[arg(long, global = true, env = "NATS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Require a TLS connection
    #[arg(long, global = true)]
    tls: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a message
    Pub {
        /// Subject to publish on
        subject: String,

        /// Message payload
        data: String,

        /// Reply subject
        #[arg(short, long)]
        reply: Option<String>,

        /// Number of times to publish
        #[arg(long, default_value = "1")]
        count: u64,

        /// Header as Key:Value (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Subscribe to a subject and print what arrives
    Sub {
        /// Subject, wildcards allowed
        subject: String,

        /// Queue group
        #[arg(short, long)]
        queue: Option<String>,

        /// Exit after this many messages
        #[arg(long)]
        count: Option<u64>,

        /// Print each message as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Send a request and wait for the reply
    Req {
        /// Subject to send the request to
        subject: String,

        /// Request payload
        data: String,

        /// How long to wait for the reply, in milliseconds
        #[arg(short, long, default_value = "2000")]
        timeout: u64,

        /// Header as Key:Value (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Answer requests with a fixed response
    Reply {
        /// Subject to serve
        subject: String,

        /// Response payload
        response: String,

        /// Queue group
        #[arg(short, long)]
        queue: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = CliConfig::load(cli.config.as_deref())?;
    let level = cli
        .log_level
        .clone()
        .or_else(|| file.log_level.clone())
        .unwrap_or_else(|| "warn".to_string());
    let json_logs = cli.json_logs || file.json_logs.unwrap_or(false);
    setup_logging(&level, json_logs)?;

    let config = file.merge(Overrides {
        server: cli.server,
        name: cli.name,
        user: cli.user,
        password: cli.password,
        token: cli.token,
        tls: cli.tls,
    });
    debug!(server = ?config.server, "Configuration loaded");

    // Handle Ctrl+C
    let running = Arc::new(AtomicBool::new(true));
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            running.store(false, Ordering::SeqCst);
            let _ = shutdown_tx.send(());
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    let conn = connect(&config)?;

    let outcome = match cli.command {
        Commands::Pub {
            subject,
            data,
            reply,
            count,
            headers,
        } => publish(&conn, &subject, &data, reply.as_deref(), count, &headers),

        Commands::Sub {
            subject,
            queue,
            count,
            json,
        } => subscribe(&conn, &subject, queue.as_deref(), count, json, &running),

        Commands::Req {
            subject,
            data,
            timeout,
            headers,
        } => request(
            &conn,
            &subject,
            &data,
            Duration::from_millis(timeout),
            &headers,
        ),

        Commands::Reply {
            subject,
            response,
            queue,
        } => serve_replies(&conn, &subject, &response, queue.as_deref(), &shutdown_rx),
    };

    if let Err(e) = conn.drain() {
        debug!("Drain on exit failed: {}", e);
        conn.close();
    }
    outcome
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn connect(config: &CliConfig) -> Result<Connection> {
    let opts = config
        .to_options()
        .disconnected_callback(|_| warn!("Disconnected"))
        .reconnected_callback(|conn| {
            info!(
                "Reconnected to {}",
                conn.connected_url().unwrap_or_default()
            )
        })
        .error_callback(|_, sub, err| match sub {
            Some(sub) => warn!("Error on {}: {}", sub.subject(), err),
            None => warn!("Async error: {}", err),
        });

    let server = config.server.as_deref().unwrap_or("default server");
    let conn = opts
        .connect()
        .with_context(|| format!("Failed to connect to {}", server))?;
    info!(
        "Connected to {} ({})",
        conn.connected_url().unwrap_or_default(),
        conn.connected_server_id().unwrap_or_default()
    );
    Ok(conn)
}

/// Parse repeated `Key:Value` arguments
fn parse_headers(raw: &[String]) -> Result<Option<HeaderMap>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut headers = HeaderMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once(':')
            .with_context(|| format!("Header must be Key:Value, got '{}'", entry))?;
        headers.append(key.trim(), value.trim());
    }
    Ok(Some(headers))
}

fn publish(
    conn: &Connection,
    subject: &str,
    data: &str,
    reply: Option<&str>,
    count: u64,
    headers: &[String],
) -> Result<()> {
    let mut msg = Message::new(subject, data.to_string());
    if let Some(reply) = reply {
        msg = msg.with_reply(reply);
    }
    if let Some(headers) = parse_headers(headers)? {
        msg = msg.with_headers(headers);
    }
    for _ in 0..count {
        conn.publish_message(&msg)?;
    }
    conn.flush().context("Flush after publish failed")?;

    println!(
        "{} Published {} message(s) to {}",
        "OK".green().bold(),
        count,
        subject.yellow()
    );
    Ok(())
}

fn subscribe(
    conn: &Connection,
    subject: &str,
    queue: Option<&str>,
    count: Option<u64>,
    json: bool,
    running: &AtomicBool,
) -> Result<()> {
    let sub = match queue {
        Some(q) => conn.queue_subscribe_sync(subject, q)?,
        None => conn.subscribe_sync(subject)?,
    };
    if let Some(max) = count {
        sub.auto_unsubscribe(max)?;
    }
    conn.flush()?;

    if !json {
        println!(
            "{} Listening on {}",
            "OK".green().bold(),
            subject.yellow()
        );
    }

    let mut received = 0u64;
    while running.load(Ordering::SeqCst) {
        match sub.next_message(POLL_INTERVAL) {
            Ok(msg) => {
                received += 1;
                if json {
                    println!("{}", message_json(&msg));
                } else {
                    print_message(received, &msg);
                }
            }
            Err(e) if e.is_timeout() => continue,
            Err(ClientError::SlowConsumer) => warn!("Messages dropped, consumer too slow"),
            Err(ClientError::MaxDeliveredMsgs) => break,
            Err(e) => return Err(e).context("Subscription ended"),
        }
    }
    Ok(())
}

fn request(
    conn: &Connection,
    subject: &str,
    data: &str,
    timeout: Duration,
    headers: &[String],
) -> Result<()> {
    let reply = match parse_headers(headers)? {
        Some(h) => conn.request_with_headers(subject, &h, data, timeout),
        None => conn.request(subject, data, timeout),
    };
    let reply = match reply {
        Ok(reply) => reply,
        Err(ClientError::NoResponders) => anyhow::bail!("No responders on {}", subject),
        Err(e) => return Err(e).with_context(|| format!("Request to {} failed", subject)),
    };
    print_message(1, &reply);
    Ok(())
}

fn serve_replies(
    conn: &Connection,
    subject: &str,
    response: &str,
    queue: Option<&str>,
    shutdown_rx: &mpsc::Receiver<()>,
) -> Result<()> {
    let served = Arc::new(AtomicU64::new(0));
    let responder = conn.clone();
    let body = response.to_string();
    let counter = served.clone();
    let handler = move |msg: Message| {
        let Some(reply) = msg.reply.as_deref() else {
            debug!("Ignoring message without reply subject on {}", msg.subject);
            return;
        };
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        println!("{} #{} on {}", "REQ".cyan(), n, msg.subject.yellow());
        if let Err(e) = responder.publish(reply, body.as_bytes()) {
            warn!("Failed to send reply: {}", e);
        }
    };

    let _sub = match queue {
        Some(q) => conn.queue_subscribe(subject, q, handler)?,
        None => conn.subscribe(subject, handler)?,
    };
    conn.flush()?;
    println!(
        "{} Answering requests on {}",
        "OK".green().bold(),
        subject.yellow()
    );

    // Wait for Ctrl+C
    let _ = shutdown_rx.recv();
    println!(
        "{} Served {} request(s)",
        "Stopped".yellow(),
        served.load(Ordering::Relaxed)
    );
    Ok(())
}

fn print_message(n: u64, msg: &Message) {
    match &msg.reply {
        Some(reply) => println!(
            "{} #{} on {} (reply: {})",
            "MSG".cyan().bold(),
            n,
            msg.subject.yellow(),
            reply
        ),
        None => println!("{} #{} on {}", "MSG".cyan().bold(), n, msg.subject.yellow()),
    }
    if let Some(headers) = &msg.headers {
        if let Some(status) = headers.status() {
            println!("  status: {}", status);
        }
        for (key, values) in headers.iter() {
            for value in values {
                println!("  {}: {}", key.green(), value);
            }
        }
    }
    println!("{}", String::from_utf8_lossy(&msg.payload));
}

fn message_json(msg: &Message) -> serde_json::Value {
    let headers = msg.headers.as_ref().map(|h| {
        h.iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect::<serde_json::Map<_, _>>()
    });
    serde_json::json!({
        "subject": msg.subject,
        "reply": msg.reply,
        "headers": headers,
        "payload": String::from_utf8_lossy(&msg.payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let parsed = parse_headers(&["X-Trace: abc".into(), "X-Trace:def".into()])
            .unwrap()
            .unwrap();
        assert_eq!(parsed.get_all("X-Trace").unwrap(), ["abc", "def"]);
        assert!(parse_headers(&[]).unwrap().is_none());
        assert!(parse_headers(&["no-colon".into()]).is_err());
    }

    #[test]
    fn test_message_json() {
        let mut headers = HeaderMap::new();
        headers.insert("K", "v");
        let msg = Message::new("a.b", "hi")
            .with_reply("_INBOX.x")
            .with_headers(headers);
        let value = message_json(&msg);
        assert_eq!(value["subject"], "a.b");
        assert_eq!(value["reply"], "_INBOX.x");
        assert_eq!(value["headers"]["K"][0], "v");
        assert_eq!(value["payload"], "hi");
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "nats", "sub", "orders.>", "--queue", "workers", "--server", "nats://x:4222", "--tls",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("nats://x:4222"));
        assert!(cli.tls);
        match cli.command {
            Commands::Sub { subject, queue, .. } => {
                assert_eq!(subject, "orders.>");
                assert_eq!(queue.as_deref(), Some("workers"));
            }
            _ => panic!("expected sub"),
        }
    }
}
