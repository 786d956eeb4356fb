mod config;
mod decode;
mod error;
mod fetch;
mod object_id;
mod protocol;
mod render;
mod server;
mod store;
mod utils;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{Config, DEFAULT_CONFIG_FILE};
use error::FetchError;
use protocol::ObjectState;
use server::StoreServer;
use store::StoreClient;

#[derive(Parser)]
#[command(name = "plasmacat")]
#[command(about = "Read record batches out of a shared-memory object store")]
#[command(subcommand_negates_reqs = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(help = "Store socket path", required = true)]
    store: Option<String>,

    #[arg(help = "Object id, left-padded to the canonical width", required = true)]
    object_id: Option<String>,

    #[arg(long, global = true, help = "Config file path")]
    config: Option<String>,

    #[arg(long, global = true, help = "Output as JSON")]
    json: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a store daemon on a Unix socket
    Serve {
        socket: String,
        #[arg(long, help = "Directory for object files (overrides config)")]
        objects_dir: Option<String>,
        #[arg(long, help = "Store capacity in bytes (overrides config)")]
        capacity: Option<u64>,
    },
    /// Write a record batch into the store
    Put {
        store: String,
        object_id: String,
        #[arg(long, default_value_t = 10, conflicts_with = "ipc", help = "Rows of the generated sequence batch")]
        rows: usize,
        #[arg(long, help = "Upload an existing Arrow IPC stream file instead")]
        ipc: Option<String>,
    },
    /// List objects held by the store
    List { store: String },
    /// Delete a sealed object
    Delete { store: String, object_id: String },
    /// Print a random object id usable with put, delete and fetch
    RandomId,
    /// Write the default configuration to a file
    GenerateConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE, help = "Config file path")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Some(Commands::Serve { .. }) => "plasmacat=info",
        _ => "plasmacat=warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let json = cli.json;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.downcast_ref::<FetchError>().map(FetchError::exit_code).unwrap_or(1);
            if json {
                println!("{}", serde_json::json!({"error": format!("{:#}", e), "exit_code": code}));
            } else {
                eprintln!("❌ error: {:#}", e);
            }
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        None => {
            // clap enforces both positionals when no subcommand is given
            let store = cli.store.unwrap_or_default();
            let token = cli.object_id.unwrap_or_default();

            let (id, batch) = fetch::fetch(&config, &store, &token).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&render::render_json(&id, &batch)?)?);
            } else {
                println!("{}", render::render_text(&id, &batch)?);
            }
        }
        Some(Commands::Serve { socket, objects_dir, capacity }) => {
            if let Some(dir) = objects_dir {
                config.server.objects_dir = dir.into();
            }
            if let Some(capacity) = capacity {
                config.server.capacity_bytes = capacity;
            }

            let server = StoreServer::bind(&socket, &config.server)?;
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutting down store on {}", socket);
                }
            }
        }
        Some(Commands::Put { store, object_id, rows, ipc }) => {
            let id = config.identifier.normalize(&object_id)?;
            let payload = match ipc {
                Some(path) => {
                    let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path))?;
                    // refuse to store something readers could not decode
                    decode::decode_single_batch(arrow::buffer::Buffer::from_slice_ref(&bytes))?;
                    bytes
                }
                None => decode::encode_stream(&[decode::sequence_batch(rows)?])?,
            };

            let mut client = connect(&config, &store).await?;
            if client.contains(&id).await? {
                anyhow::bail!("object {} is already stored", id.escaped());
            }
            let digest = client.create_and_write(&id, &payload).await?;
            client.disconnect().await?;

            if cli.json {
                println!("{}", serde_json::json!({
                    "object_id": id.to_hex(),
                    "object_id_raw": id.escaped(),
                    "size": payload.len(),
                    "digest": format!("{:08x}", digest),
                }));
            } else {
                println!("✅ Stored {} ({} bytes, digest {:08x})", id.escaped(), payload.len(), digest);
            }
        }
        Some(Commands::List { store }) => {
            let mut client = connect(&config, &store).await?;
            let objects = client.list().await?;
            client.disconnect().await?;

            if cli.json {
                let entries: Vec<_> = objects.iter().map(|o| serde_json::json!({
                    "object_id": o.id.to_hex(),
                    "object_id_raw": o.id.escaped(),
                    "size": o.data_size,
                    "sealed": o.state == ObjectState::Sealed,
                    "digest": o.digest.map(|d| format!("{:08x}", d)),
                    "created_at": o.created_at,
                })).collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("📦 Objects in {}", store);
                println!("==================");
                for o in &objects {
                    let state = match o.state {
                        ObjectState::Sealed => "sealed ",
                        ObjectState::Created => "pending",
                    };
                    println!("   {} {} {:>10} bytes", o.id.escaped(), state, o.data_size);
                }
                println!("   Total: {}", objects.len());
            }
        }
        Some(Commands::Delete { store, object_id }) => {
            let id = config.identifier.normalize(&object_id)?;
            let mut client = connect(&config, &store).await?;
            client.delete(&id).await?;
            client.disconnect().await?;

            if cli.json {
                println!("{}", serde_json::json!({"deleted": id.to_hex()}));
            } else {
                println!("🗑️  Deleted {}", id.escaped());
            }
        }
        Some(Commands::RandomId) => {
            let token = config.identifier.random_token();
            if cli.json {
                println!("{}", serde_json::json!({"object_id": token}));
            } else {
                println!("{}", token);
            }
        }
        Some(Commands::GenerateConfig { output }) => {
            Config::default().save(&output)?;
            if cli.json {
                println!("{}", serde_json::json!({"written": output}));
            } else {
                println!("✅ Wrote default configuration to {}", output);
            }
        }
    }

    Ok(())
}

async fn connect(config: &Config, store: &str) -> anyhow::Result<StoreClient> {
    StoreClient::connect(store, &config.client)
        .await
        .map_err(|source| {
            anyhow::Error::from(FetchError::StoreUnavailable {
                address: store.to_string(),
                source,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_positionals_mean_fetch() {
        let cli = Cli::try_parse_from(["plasmacat", "/tmp/plasma", "42"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.store.as_deref(), Some("/tmp/plasma"));
        assert_eq!(cli.object_id.as_deref(), Some("42"));
    }

    #[test]
    fn fetch_requires_both_positionals() {
        assert!(Cli::try_parse_from(["plasmacat", "/tmp/plasma"]).is_err());
        assert!(Cli::try_parse_from(["plasmacat"]).is_err());
    }

    #[test]
    fn subcommands_do_not_need_positionals() {
        let cli = Cli::try_parse_from(["plasmacat", "put", "/tmp/plasma", "7", "--rows", "3"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Put { rows: 3, .. })));
    }

    #[tokio::test]
    async fn random_id_names_an_object_for_put_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("store.sock");
        let server_config = config::ServerConfig {
            objects_dir: dir.path().join("objects"),
            capacity_bytes: 1 << 20,
        };
        tokio::spawn(StoreServer::bind(&socket, &server_config).unwrap().run());
        let socket = socket.to_str().unwrap();

        let token = Config::default().identifier.random_token();
        let put = Cli::try_parse_from(["plasmacat", "put", socket, token.as_str(), "--rows", "3"]).unwrap();
        run(put).await.unwrap();

        let fetch_cli = Cli::try_parse_from(["plasmacat", socket, token.as_str()]).unwrap();
        run(fetch_cli).await.unwrap();

        let (id, batch) = fetch::fetch(&Config::default(), socket, &token).await.unwrap();
        assert_eq!(id.as_bytes(), token.as_bytes());
        assert_eq!(batch.num_rows(), 3);
    }

    #[tokio::test]
    async fn run_reports_fetch_errors_typed() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("none.sock");
        let cli = Cli::try_parse_from(["plasmacat", socket.to_str().unwrap(), "42"]).unwrap();

        let err = run(cli).await.unwrap_err();
        let fetch_err = err.downcast_ref::<FetchError>().unwrap();
        assert!(matches!(fetch_err, FetchError::StoreUnavailable { .. }));
        assert_eq!(fetch_err.exit_code(), 3);
    }
}
