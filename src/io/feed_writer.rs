//! Event feed sink - appends feed messages to a JSONL file
//!
//! One JSON object per line, in the order messages leave the feed channel.

use crate::io::event_feed::FeedMessage;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub struct FeedWriter {
    file_path: String,
}

impl FeedWriter {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "feed_writer_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write one message. Returns true if it reached the file.
    pub fn write(&self, message: &FeedMessage) -> bool {
        let result = message
            .to_json()
            .map_err(std::io::Error::from)
            .and_then(|json| self.append_line(&json));

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(kind = %message.kind(), error = %e, "feed_write_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "feed_written");

        Ok(())
    }

    /// Drain the feed channel until every sender is gone
    pub async fn run(self, mut rx: mpsc::Receiver<FeedMessage>) {
        info!(file_path = %self.file_path, "feed_writer_started");
        let mut written = 0u64;
        while let Some(message) = rx.recv().await {
            if self.write(&message) {
                written += 1;
            }
        }
        info!(written = %written, "feed_writer_stopped");
    }
}
