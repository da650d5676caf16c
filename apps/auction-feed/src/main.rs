mod cli;

use anyhow::Context;
use auction_feed_client::logging;
use auction_feed_client::proto::{BidEvent, SequenceNumber};
use auction_feed_client::transport::WebSocketTransport;
use auction_feed_client::{ClientError, Degraded, SessionError, SessionHandle, SessionObserver};
use clap::Parser;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncBufReadExt, BufReader};

use cli::{parse_input, Cli, Input};

const HELP: &str = "commands: bid <amount> | sync | reconnect | stats | status | quit";

/// Prints session activity to stdout.
struct ConsoleObserver {
    json: bool,
}

impl SessionObserver for ConsoleObserver {
    fn on_snapshot(&mut self, sequence: SequenceNumber, data: Option<&Value>) {
        match data {
            Some(data) => println!("snapshot @{sequence}: {data}"),
            None => println!("snapshot @{sequence}"),
        }
    }

    fn on_event_accepted(&mut self, event: &BidEvent) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("failed to encode event {}: {err}", event.sequence),
            }
            return;
        }
        let at = event
            .server_time()
            .and_then(|time| time.format(&Rfc3339).ok())
            .unwrap_or_else(|| event.timestamp.to_string());
        println!(
            "#{:<6} {:>10}  {} (bid {})  {at}",
            event.sequence, event.amount, event.username, event.bid_count
        );
    }

    fn on_error(&mut self, error: &SessionError) {
        if error.is_fatal() {
            eprintln!("error: {error}; type `reconnect` to try again");
        } else {
            eprintln!("error: {error}");
        }
    }

    fn on_connected(&mut self) {
        eprintln!("connected");
    }

    fn on_disconnected(&mut self) {
        eprintln!("disconnected");
    }

    fn on_degraded(&mut self, reason: &Degraded) {
        eprintln!("warning: {reason}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;
    let config = cli.feed_config().context("invalid configuration")?;

    let observer = ConsoleObserver { json: cli.json };
    let (session, task) = auction_feed_client::spawn(config, WebSocketTransport::new(), observer);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if !run_input(&session, &line).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await;
    task.await.context("session task failed")?;
    Ok(())
}

/// Executes one operator command. Returns false when the operator quits.
async fn run_input(session: &SessionHandle, line: &str) -> bool {
    let Some(input) = parse_input(line) else {
        return true;
    };
    let outcome = match input {
        Input::Bid(amount) => session.submit_bid_text(amount).await,
        Input::Sync => session.request_resync(),
        Input::Reconnect => session.reconnect(),
        Input::Stats => session.stats().await.map(|stats| {
            match serde_json::to_string_pretty(&stats) {
                Ok(text) => println!("{text}"),
                Err(err) => eprintln!("failed to encode stats: {err}"),
            }
        }),
        Input::Status => {
            println!("{}", session.status());
            Ok(())
        }
        Input::Help => {
            println!("{HELP}");
            Ok(())
        }
        Input::Quit => return false,
        Input::Unknown(word) => {
            eprintln!("unknown command {word:?}; {HELP}");
            Ok(())
        }
    };
    match outcome {
        Ok(()) => true,
        Err(ClientError::SessionClosed) => false,
        Err(err) => {
            eprintln!("{err}");
            true
        }
    }
}
