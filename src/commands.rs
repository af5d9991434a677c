//! Subcommands and how each one drives the library.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use marketsync::api::{
  HttpRemote, ListQuery, NewResource, Resource, ResourceClient, ResourceStatus, ResourceUpdate,
  StatusChange,
};
use marketsync::cache::{CacheStorage, SqliteStorage};
use marketsync::realtime::{ConfigSyncClient, ConnectionPool, WsConnector};
use marketsync::state::{ResourceStore, RolePermissions};

use crate::config::{CacheConfig, Config};

type Client = ResourceClient<HttpRemote, SqliteStorage>;

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
  /// List resources
  #[command(alias = "ls")]
  List {
    #[arg(long)]
    status: Option<ResourceStatus>,

    /// Only resources by this author id
    #[arg(long)]
    author: Option<String>,

    /// Match against title, description and tags
    #[arg(short, long)]
    search: Option<String>,

    /// Fetch one page instead of everything
    #[arg(long)]
    page: Option<u32>,

    #[arg(long)]
    page_size: Option<u32>,
  },

  /// Show one resource
  Get { id: String },

  /// Create a resource
  Create {
    #[arg(long)]
    title: String,

    #[arg(long)]
    description: Option<String>,

    /// Content as a JSON document
    #[arg(long, value_parser = parse_json)]
    content: Option<Value>,

    /// Tag to attach (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,
  },

  /// Edit a resource
  Update {
    id: String,

    #[arg(long)]
    title: Option<String>,

    #[arg(long)]
    description: Option<String>,

    #[arg(long, value_parser = parse_json)]
    content: Option<Value>,

    /// Replace the tags (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Version the edit is based on (default: the latest known)
    #[arg(long)]
    version: Option<u64>,
  },

  /// Move a resource to another lifecycle status
  Status {
    id: String,

    status: ResourceStatus,

    #[arg(long)]
    reason: Option<String>,

    #[arg(long)]
    version: Option<u64>,
  },

  /// Delete a resource
  #[command(alias = "rm")]
  Delete { id: String },

  /// Reconcile the local cache with the server
  Sync,

  /// Remove expired cache entries
  Purge,

  /// Drop every cached resource
  Clear,

  /// Show queued writes, or replay them
  Outbox {
    #[arg(long)]
    flush: bool,
  },

  /// Push a configuration document (YAML or JSON) over the realtime channel
  PushConfig { file: PathBuf },
}

fn parse_json(raw: &str) -> std::result::Result<Value, String> {
  serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {}", e))
}

pub async fn run(command: Command, config: &Config, use_cache: bool) -> Result<()> {
  if let Command::PushConfig { file } = &command {
    return push_config(config, file).await;
  }

  let client = build_client(config)?;
  let outcome = execute(command, config, &client, use_cache).await;

  // A cache-served read may have started a reconciliation pass; let it land
  // before the runtime goes away.
  client.coordinator().wait_until_idle().await;
  outcome
}

async fn execute(command: Command, config: &Config, client: &Arc<Client>, use_cache: bool) -> Result<()> {
  match command {
    Command::List {
      status,
      author,
      search,
      page,
      page_size,
    } => {
      let query = ListQuery {
        page,
        page_size: page_size.or(config.api.page_size),
        status,
        author,
        search,
      };
      print_json(&client.get_all(&query, use_cache).await)
    }

    Command::Get { id } => match client.get_by_id(&id, use_cache).await? {
      Some(result) => print_json(&result),
      None => Err(eyre!("Resource {} not found", id)),
    },

    Command::Create {
      title,
      description,
      content,
      tags,
    } => {
      let store = store(config, client);
      let created = store
        .create(NewResource {
          title,
          description,
          content: content.unwrap_or_default(),
          tags,
        })
        .await?;
      print_json(&created)
    }

    Command::Update {
      id,
      title,
      description,
      content,
      tags,
      version,
    } => {
      let store = store(config, client);
      store.load(false).await;
      let version = resolve_version(&store, &id, version)?;
      let update = ResourceUpdate {
        title,
        description,
        content,
        tags: (!tags.is_empty()).then_some(tags),
        version,
      };
      print_json(&store.update(&id, update).await?)
    }

    Command::Status {
      id,
      status,
      reason,
      version,
    } => {
      let store = store(config, client);
      store.load(false).await;
      let version = resolve_version(&store, &id, version)?;
      let change = StatusChange {
        status,
        version,
        reason,
      };
      print_json(&store.update_status(&id, change).await?)
    }

    Command::Delete { id } => {
      let store = store(config, client);
      store.load(false).await;
      store.delete(&id).await?;
      print_json(&json!({ "deleted": id }))
    }

    Command::Sync => match client.coordinator().reconcile().await {
      Some(report) => print_json(&report),
      None => Err(eyre!("Sync did not complete, see the log for details")),
    },

    Command::Purge => {
      let removed = client.storage().clean_expired()?;
      print_json(&json!({ "removed": removed }))
    }

    Command::Clear => {
      client.storage().clear::<Resource>()?;
      print_json(&json!({ "cleared": true }))
    }

    Command::Outbox { flush: true } => print_json(&client.flush_outbox().await),

    Command::Outbox { flush: false } => print_json(&client.storage().pending_operations()?),

    Command::PushConfig { file } => push_config(config, &file).await,
  }
}

fn build_client(config: &Config) -> Result<Arc<Client>> {
  let remote = HttpRemote::new(&config.api.base_url, &config.api.collection)?
    .with_token(Config::get_api_token());
  let storage = open_storage(&config.cache)?;
  debug!(base_url = %config.api.base_url, outbox = config.api.outbox, "Client ready");

  Ok(Arc::new(
    ResourceClient::new(Arc::new(remote), Arc::new(storage), config.retry_policy())
      .with_outbox(config.api.outbox),
  ))
}

fn open_storage(cache: &CacheConfig) -> Result<SqliteStorage> {
  let ttl = i64::try_from(cache.ttl_secs)
    .ok()
    .and_then(chrono::Duration::try_seconds)
    .ok_or_else(|| eyre!("cache.ttl_secs is out of range: {}", cache.ttl_secs))?;

  let storage = if cache.in_memory {
    SqliteStorage::open_in_memory()?
  } else if let Some(path) = &cache.path {
    SqliteStorage::open(path)?
  } else {
    SqliteStorage::open_default()?
  };
  Ok(storage.with_ttl(ttl))
}

fn store(config: &Config, client: &Arc<Client>) -> ResourceStore<HttpRemote, SqliteStorage> {
  ResourceStore::new(Arc::clone(client), RolePermissions, config.actor.clone())
}

fn resolve_version(
  store: &ResourceStore<HttpRemote, SqliteStorage>,
  id: &str,
  explicit: Option<u64>,
) -> Result<u64> {
  match explicit {
    Some(version) => Ok(version),
    None => store
      .get(id)
      .map(|r| r.version)
      .ok_or_else(|| eyre!("Resource {} not found; pass --version to edit it anyway", id)),
  }
}

async fn push_config(config: &Config, file: &Path) -> Result<()> {
  let realtime = config
    .realtime
    .as_ref()
    .ok_or_else(|| eyre!("No realtime section in the configuration"))?;

  let contents = std::fs::read_to_string(file)
    .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
  let document: Value = serde_yaml::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse {}: {}", file.display(), e))?;

  let pool = Arc::new(ConnectionPool::new(
    WsConnector::new(realtime.connection_settings(&config.retry)),
    realtime.pool_settings(),
  ));
  let client = ConfigSyncClient::new(
    Arc::clone(&pool),
    &realtime.url,
    config.retry_policy(),
    realtime.ack_timeout(),
  );

  let outcome = client.push(&document).await;
  pool.close_all();

  let id = outcome?;
  print_json(&json!({ "id": id, "acknowledged": true }))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
