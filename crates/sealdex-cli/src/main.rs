//! sealdex — serve the gateway or drive the client pipeline
//!
//! Exit codes: 0 success, 2 authentication failure, 3 network failure,
//! 4 any server-side error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use sealdex_client::{ClientConfig, SearchPipeline, SessionState};
use sealdex_core::{LshConfig, SearchError};
use sealdex_gateway::GatewayConfig;
use sealdex_store::SearchDb;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sealdex", version, about = "Privacy-preserving encrypted vector search")]
struct Cli {
    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Where the client session (id + planes) is persisted
    #[arg(long, global = true, default_value = "sealdex-session.json")]
    session: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        db: Option<String>,
    },
    /// Provision this API key's client and persist the session
    Init {
        #[arg(long, default_value_t = 384)]
        dim: usize,
        #[arg(long, default_value_t = 20)]
        tables: u32,
        #[arg(long, default_value_t = 16)]
        hash_size: u32,
        #[arg(long, default_value_t = 100)]
        candidates: u32,
    },
    /// Embed, encrypt, and upload a text
    Add {
        text: String,
        /// JSON object attached as metadata
        #[arg(long)]
        metadata: Option<String>,
        #[arg(long)]
        external_id: Option<String>,
    },
    /// Search and print decrypted rankings
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        #[arg(long, default_value_t = 50)]
        rerank: usize,
    },
    /// Show usage counters for this client
    Stats,
    /// Hard-delete soft-deleted embeddings past the retention horizon
    /// (local maintenance, runs against the database file directly)
    Purge {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long)]
        db: Option<String>,
    },
}

/// Session file contents: everything needed to resume without re-init
#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    client_id: Uuid,
    planes: String,
    embedding_dim: usize,
    lsh: LshConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn exit_code(err: &SearchError) -> u8 {
    match err {
        SearchError::Unauthenticated => 2,
        SearchError::Network(_) => 3,
        _ => 4,
    }
}

async fn run(cli: Cli) -> Result<(), SearchError> {
    match cli.command {
        Command::Serve { bind, db } => {
            let mut config = GatewayConfig::from_env();
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            sealdex_gateway::serve(config)
                .await
                .map_err(|e| SearchError::Internal(e.to_string()))
        }

        Command::Init {
            dim,
            tables,
            hash_size,
            candidates,
        } => {
            let mut config = ClientConfig::from_env();
            config.embedding_dim = dim;
            config.lsh = LshConfig {
                num_tables: tables,
                hash_size,
                num_candidates: candidates,
            };
            let lsh = config.lsh;

            let mut pipeline = SearchPipeline::new(config);
            let client_id = pipeline.initialize().await?;
            let state = pipeline
                .session_state()
                .ok_or_else(|| SearchError::Internal("no session after initialize".into()))?;
            save_session(
                &cli.session,
                &StoredSession {
                    client_id,
                    planes: state.planes,
                    embedding_dim: dim,
                    lsh,
                },
            )?;

            if cli.json {
                println!("{}", serde_json::json!({ "client_id": client_id }));
            } else {
                println!("initialized client {client_id}");
            }
            Ok(())
        }

        Command::Add {
            text,
            metadata,
            external_id,
        } => {
            let metadata = metadata
                .map(|raw| {
                    serde_json::from_str(&raw).map_err(|e| {
                        SearchError::InvalidRequest(format!("--metadata is not valid JSON: {e}"))
                    })
                })
                .transpose()?;

            let pipeline = resume(&cli.session)?;
            let embedding_id = pipeline.add_embedding(&text, metadata, external_id).await?;

            if cli.json {
                println!("{}", serde_json::json!({ "embedding_id": embedding_id }));
            } else {
                println!("stored {embedding_id}");
            }
            Ok(())
        }

        Command::Search {
            query,
            top_k,
            rerank,
        } => {
            let pipeline = resume(&cli.session)?;
            let (ranked, response) = pipeline.search_text(&query, top_k, rerank).await?;

            if cli.json {
                let rows: Vec<_> = ranked
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "embedding_id": r.embedding_id,
                            "similarity": r.similarity,
                            "metadata": r.metadata,
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::json!({
                        "results": rows,
                        "candidates_found": response.candidates_found,
                        "candidates_checked": response.candidates_checked,
                        "search_time_ms": response.search_time_ms,
                    })
                );
            } else {
                println!(
                    "{} results ({} candidates checked, {:.1} ms)",
                    ranked.len(),
                    response.candidates_checked,
                    response.search_time_ms
                );
                for (rank, result) in ranked.iter().enumerate() {
                    println!(
                        "{:>3}. {:.4}  {}  {}",
                        rank + 1,
                        result.similarity,
                        result.embedding_id,
                        result
                            .metadata
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_default()
                    );
                }
            }
            Ok(())
        }

        Command::Stats => {
            let pipeline = resume(&cli.session)?;
            let stats = pipeline.stats().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());
            } else {
                println!(
                    "client {}: {} embeddings, {} searches, active: {}",
                    stats.client_id, stats.total_embeddings, stats.total_searches, stats.is_active
                );
            }
            Ok(())
        }

        Command::Purge { days, db } => {
            let path = db.unwrap_or_else(|| GatewayConfig::from_env().db_path);
            let store = SearchDb::open(&path)?;
            let purged = store.purge_deleted(days).await?;
            if cli.json {
                println!("{}", serde_json::json!({ "purged": purged }));
            } else {
                println!("purged {purged} embeddings older than {days} days");
            }
            Ok(())
        }
    }
}

fn resume(session_path: &PathBuf) -> Result<SearchPipeline, SearchError> {
    let stored = load_session(session_path)?;
    let mut config = ClientConfig::from_env();
    config.embedding_dim = stored.embedding_dim;
    config.lsh = stored.lsh;

    let mut pipeline = SearchPipeline::new(config);
    pipeline.restore_session(SessionState {
        client_id: stored.client_id,
        planes: stored.planes,
    })?;
    Ok(pipeline)
}

fn load_session(path: &PathBuf) -> Result<StoredSession, SearchError> {
    let raw = std::fs::read_to_string(path).map_err(|_| {
        SearchError::InvalidRequest(format!(
            "no session at {}; run `sealdex init` first",
            path.display()
        ))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| SearchError::Internal(format!("session file unreadable: {e}")))
}

fn save_session(path: &PathBuf, session: &StoredSession) -> Result<(), SearchError> {
    let raw = serde_json::to_string_pretty(session)
        .map_err(|e| SearchError::Internal(format!("session serialization failed: {e}")))?;
    std::fs::write(path, raw)
        .map_err(|e| SearchError::Internal(format!("could not write session file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&SearchError::Unauthenticated), 2);
        assert_eq!(exit_code(&SearchError::Network("refused".into())), 3);
        assert_eq!(exit_code(&SearchError::Internal("boom".into())), 4);
        assert_eq!(exit_code(&SearchError::QuotaExceeded(10)), 4);
    }

    #[test]
    fn test_session_file_roundtrip() {
        let dir = std::env::temp_dir().join("sealdex-cli-session-test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("session.json");

        let session = StoredSession {
            client_id: Uuid::new_v4(),
            planes: "AAAA".into(),
            embedding_dim: 16,
            lsh: LshConfig::default(),
        };
        save_session(&path, &session).unwrap();
        let loaded = load_session(&path).unwrap();
        assert_eq!(loaded.client_id, session.client_id);
        assert_eq!(loaded.embedding_dim, 16);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_session_is_actionable() {
        let err = load_session(&PathBuf::from("/definitely/not/here.json")).unwrap_err();
        assert!(err.to_string().contains("sealdex init"));
    }
}
