use std::path::PathBuf;

use clap::{Parser, Subcommand};
use doc_storage_core::HistoryPolicy;

/// Configuration for the doc-storage command-line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "doc-storage")]
#[command(about = "Read, write and roll back CRDT documents in a local space")]
pub struct Config {
    /// Base directory holding one subdirectory per space
    #[arg(long, global = true, env = "DOC_STORAGE_DIR")]
    pub dir: Option<PathBuf>,

    /// Space to operate on
    #[arg(long, global = true, default_value = "default", env = "DOC_STORAGE_SPACE")]
    pub space: String,

    /// Minimum distance between two automatic history rows, in milliseconds
    #[arg(long, global = true, env = "DOC_STORAGE_HISTORY_INTERVAL_MS")]
    pub history_interval_ms: Option<i64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Append a binary update file to a document
    Push {
        doc: String,
        file: PathBuf,
        #[arg(long)]
        editor: Option<String>,
    },
    /// Squash pending updates and show the snapshot
    Get {
        doc: String,
        /// Write the snapshot blob to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compute what a peer is missing
    Diff {
        doc: String,
        /// State vector file of the peer; the full document without it
        #[arg(long)]
        state: Option<PathBuf>,
        /// Write the missing update to this file
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write the document's state vector to this file
        #[arg(long)]
        state_out: Option<PathBuf>,
    },
    /// List documents changed after a timestamp
    Timestamps {
        #[arg(long)]
        after: Option<i64>,
    },
    /// List history rows of a document, newest first
    History {
        doc: String,
        #[arg(long)]
        skip: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Restore a document to a history row
    Rollback {
        doc: String,
        timestamp: i64,
        #[arg(long)]
        editor: Option<String>,
    },
    /// Delete a document with its updates and history
    Delete { doc: String },
    /// Delete the whole space
    DeleteSpace,
    /// Register display metadata for an editor id
    Editor {
        id: String,
        name: String,
        #[arg(long)]
        avatar_url: Option<String>,
    },
}

impl Config {
    /// Get the effective base directory.
    pub fn effective_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("doc-storage")
        })
    }

    pub fn history_policy(&self) -> HistoryPolicy {
        match self.history_interval_ms {
            Some(min_interval_ms) => HistoryPolicy { min_interval_ms },
            None => HistoryPolicy::default(),
        }
    }
}
