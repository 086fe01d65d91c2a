//! Operator console: one command per stdin line.
//!
//! Parsing happens here; anything valid goes onto the bounded command
//! channel. A full channel simply blocks the console, never the node
//! loop. Bad input costs one diagnostic line and nothing else.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::reactor::{DebugCode, NodeCommand};

const HELP: &str = "\
commands:
  START <artifact-url> <entry-point> <start> <end> <output-file>
  DISCONNECT
  DEBUG <1|2>        1 = potential and links, 2 = app id
  CACHE <true|false>
  HELP";

/// Run until stdin closes or the node shuts down.
pub async fn run(commands: mpsc::Sender<NodeCommand>, mut shutdown: broadcast::Receiver<()>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    match parse_line(&line) {
                        Ok(Some(cmd)) => {
                            if commands.send(cmd).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(diag) => eprintln!("{diag}"),
                    }
                }
                Ok(None) => {
                    debug!("console: stdin closed");
                    return;
                }
                Err(err) => {
                    debug!(%err, "console: read error");
                    return;
                }
            },
            _ = shutdown.recv() => return,
        }
    }
}

/// `Ok(None)` means the line was handled locally (HELP, blank line).
fn parse_line(line: &str) -> Result<Option<NodeCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    match verb.to_ascii_uppercase().as_str() {
        "START" => {
            let args: Vec<&str> = words.collect();
            if args.len() != 5 {
                return Err("usage: START <artifact-url> <entry-point> <start> <end> <output-file>".into());
            }
            let start: i64 = args[2].parse().map_err(|_| format!("bad start value: {}", args[2]))?;
            let end: i64 = args[3].parse().map_err(|_| format!("bad end value: {}", args[3]))?;
            if end < start {
                return Err(format!("empty or inverted range [{start}, {end})"));
            }
            if end.checked_sub(start).is_none() {
                return Err(format!("range [{start}, {end}) is wider than i64"));
            }
            Ok(Some(NodeCommand::Start {
                artifact_url: args[0].to_string(),
                entry_point: args[1].to_string(),
                start,
                end,
                output: PathBuf::from(args[4]),
            }))
        }
        "DISCONNECT" => {
            if words.next().is_some() {
                return Err("usage: DISCONNECT".into());
            }
            Ok(Some(NodeCommand::Disconnect))
        }
        "DEBUG" => match words.next() {
            Some("1") => Ok(Some(NodeCommand::Debug(DebugCode::Potential))),
            Some("2") => Ok(Some(NodeCommand::Debug(DebugCode::Id))),
            other => Err(format!("unknown debug code {:?}, try 1 or 2", other.unwrap_or(""))),
        },
        "CACHE" => match words.next() {
            Some("true") => Ok(Some(NodeCommand::Cache(true))),
            Some("false") => Ok(Some(NodeCommand::Cache(false))),
            _ => Err("usage: CACHE <true|false>".into()),
        },
        "HELP" => {
            println!("{HELP}");
            Ok(None)
        }
        other => Err(format!("unknown command {other}, try HELP")),
    }
}
