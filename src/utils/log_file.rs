//! Tracing setup: stderr `fmt` output plus a persistent file log.

use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the verbosity count when set.
pub fn init(verbose: u8, log_path: &Path) -> Result<()> {
    let default_filter = match verbose {
        0 => "warn,p2pshare=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_layer = FileLogLayer::new(log_path)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

struct MessageVisitor {
    message: String,
}

impl MessageVisitor {
    fn append(&mut self, field: &Field, value: std::fmt::Arguments<'_>) {
        if field.name() == "message" {
            let fields = std::mem::take(&mut self.message);
            self.message = value.to_string();
            if !fields.is_empty() {
                self.message.push_str(" | ");
                self.message.push_str(&fields);
            }
        } else {
            if !self.message.is_empty() {
                self.message.push_str(", ");
            }
            self.message.push_str(&format!("{} = {}", field.name(), value));
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.append(field, format_args!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.append(field, format_args!("{}", value));
    }
}

// ── File Logging Layer ──────────────────────────────────────────────────────

/// A tracing layer that appends log events to a file with full ISO 8601
/// timestamps.
pub struct FileLogLayer {
    writer: Arc<Mutex<File>>,
}

impl FileLogLayer {
    /// Create a new file log layer that appends to the specified path.
    /// Creates parent directories if they don't exist.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(file)),
        })
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
        let level = match *meta.level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };

        let line = format!(
            "[{}] {} {}: {}\n",
            timestamp,
            level,
            meta.target(),
            visitor.message
        );

        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}
