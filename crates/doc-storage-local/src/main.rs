use anyhow::Context;
use clap::Parser;
use doc_storage_core::{DocStorage, DocStorageAdapter, Editor, HistoryQuery};
use doc_storage_local::config::{Command, Config};
use doc_storage_local::LocalDocBackend;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

type LocalStorage = DocStorageAdapter<LocalDocBackend>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, command output to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let dir = config.effective_dir();
    info!("Using space {} in {}", config.space, dir.display());

    let backend =
        LocalDocBackend::new(&dir, config.space.as_str()).with_history_policy(config.history_policy());
    let storage = DocStorageAdapter::new(backend);
    storage.connect().await?;

    run(&storage, config.command).await?;

    storage.disconnect().await?;
    Ok(())
}

async fn run(storage: &LocalStorage, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Push { doc, file, editor } => {
            let bin = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read update file {}", file.display()))?;
            let count = storage
                .push_doc_updates(&doc, &[bin], editor.as_deref())
                .await?;
            print_json(&json!({ "doc": doc, "pushed": count }))?;
        }
        Command::Get { doc, out } => {
            let Some(record) = storage.get_doc(&doc).await? else {
                anyhow::bail!("Doc {} not found in space {}", doc, storage.space_id());
            };
            if let Some(out) = &out {
                tokio::fs::write(out, &record.bin)
                    .await
                    .with_context(|| format!("Failed to write {}", out.display()))?;
            }
            print_json(&json!({
                "doc": record.doc_id,
                "timestamp": record.timestamp,
                "editor": record.editor,
                "bytes": record.bin.len(),
            }))?;
        }
        Command::Diff {
            doc,
            state,
            out,
            state_out,
        } => {
            let state_vector = match &state {
                Some(path) => Some(
                    tokio::fs::read(path)
                        .await
                        .with_context(|| format!("Failed to read state vector {}", path.display()))?,
                ),
                None => None,
            };

            let Some(diff) = storage.get_doc_diff(&doc, state_vector.as_deref()).await? else {
                anyhow::bail!("Doc {} not found in space {}", doc, storage.space_id());
            };
            if let Some(out) = &out {
                tokio::fs::write(out, &diff.missing)
                    .await
                    .with_context(|| format!("Failed to write {}", out.display()))?;
            }
            if let Some(state_out) = &state_out {
                tokio::fs::write(state_out, &diff.state)
                    .await
                    .with_context(|| format!("Failed to write {}", state_out.display()))?;
            }
            print_json(&json!({
                "doc": doc,
                "timestamp": diff.timestamp,
                "missing_bytes": diff.missing.len(),
                "state_bytes": diff.state.len(),
            }))?;
        }
        Command::Timestamps { after } => {
            let timestamps = storage.get_space_doc_timestamps(after).await?;
            print_json(&json!(timestamps.unwrap_or_default()))?;
        }
        Command::History { doc, skip, limit } => {
            let histories = storage
                .list_doc_histories(&doc, HistoryQuery { skip, limit })
                .await?;
            let rows: Vec<_> = histories
                .iter()
                .map(|h| {
                    json!({
                        "timestamp": h.timestamp,
                        "editor": h.editor,
                    })
                })
                .collect();
            print_json(&json!(rows))?;
        }
        Command::Rollback {
            doc,
            timestamp,
            editor,
        } => {
            storage
                .rollback_doc(&doc, timestamp, editor.as_deref())
                .await?;
            info!("Rolled back doc {} to {}", doc, timestamp);
        }
        Command::Delete { doc } => {
            storage.delete_doc(&doc).await?;
            info!("Deleted doc {}", doc);
        }
        Command::DeleteSpace => {
            storage.delete_space().await?;
        }
        Command::Editor {
            id,
            name,
            avatar_url,
        } => {
            storage
                .backend()
                .register_editor(&id, Editor { name, avatar_url })
                .await?;
            info!("Registered editor {}", id);
        }
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
