use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Text
        } else {
            Self::Json
        }
    }
}

/// Something the `forward` command reports on stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ForwardEvent<'a> {
    Bound { host: &'a str, port: u16 },
    Accepted { connection: u64, target: &'a str },
    Closed { connection: u64 },
    Terminated { message: &'a str },
}

#[derive(Serialize)]
struct Stamped<'a> {
    #[serde(flatten)]
    event: &'a ForwardEvent<'a>,
    timestamp: String,
}

pub fn print_event(event: &ForwardEvent<'_>, format: OutputFormat) {
    let line = match format {
        OutputFormat::Json => serde_json::to_string(&Stamped {
            event,
            timestamp: now_unix_seconds(),
        })
        .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Text => render_text(event),
    };
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn render_text(event: &ForwardEvent<'_>) -> String {
    match event {
        ForwardEvent::Bound { host, port } => format!("bound {host}:{port}"),
        ForwardEvent::Accepted { connection, target } => {
            format!("accepted #{connection} -> {target}")
        }
        ForwardEvent::Closed { connection } => format!("closed #{connection}"),
        ForwardEvent::Terminated { message } => format!("terminated: {message}"),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_events_are_tagged() {
        let event = ForwardEvent::Bound {
            host: "127.0.0.1",
            port: 4242,
        };
        let json = serde_json::to_value(Stamped {
            event: &event,
            timestamp: "0".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "bound");
        assert_eq!(json["port"], 4242);
        assert_eq!(json["timestamp"], "0");
    }

    #[test]
    fn text_events_are_single_lines() {
        let line = render_text(&ForwardEvent::Accepted {
            connection: 3,
            target: "localhost:80",
        });
        assert_eq!(line, "accepted #3 -> localhost:80");
    }
}
