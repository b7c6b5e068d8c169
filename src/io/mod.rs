//! IO modules - external interfaces
//!
//! This module contains all external IO operations:
//! - `http_api` - JSON API plus /health and /metrics over hyper
//! - `event_feed` - Typed channel for outbound access events and audit entries
//! - `feed_writer` - Feed sink writing JSONL to file
//! - `prometheus` - Prometheus text exposition

pub mod event_feed;
pub mod feed_writer;
pub mod http_api;
pub mod prometheus;

// Re-export commonly used types
pub use event_feed::{create_event_feed, FeedMessage, FeedSender};
pub use feed_writer::FeedWriter;
pub use http_api::{dispatch, serve, start_api_server, ApiReply, ApiState};
