use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use streetsync::api::HttpLayerSource;
use streetsync::cache::{Layer, LayerStore, MarkerCache, NoopLayerStore, SqliteLayerStore};
use streetsync::config::{Config, SearchConfig};
use streetsync::layers::{
  stack_layers, EquipmentRecord, PanelRecord, PartnerRecord, UnifiedEntity,
};
use streetsync::logging;
use streetsync::map::{derive_markers, BBox, ClusterClient, ClusterFeature};
use streetsync::search::{search, DebouncedSearch, SearchResults};
use streetsync::sync::{SyncConfig, SyncOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "streetsync")]
#[command(about = "Sync, cache and search a street furniture inventory")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/streetsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run one sync cycle against the API
  Sync,
  /// Search the cached dataset; without a query, search each line of stdin
  Search {
    query: Option<String>,
    /// Maximum results to print
    #[arg(short, long)]
    limit: Option<usize>,
  },
  /// Show per-layer row counts and staleness
  Status,
  /// Clear one cached layer (main, panels, partner) or everything
  Clear { layer: Option<String> },
  /// Print map clusters for the cached marker set
  Clusters {
    #[arg(short, long, default_value_t = 11.0)]
    zoom: f64,
    /// Viewport as west,south,east,north (default: whole world)
    #[arg(short, long)]
    bbox: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.cache.resolve_dir()?.join("logs"), args.verbose)?;

  match args.command {
    Command::Sync => sync(&config).await,
    Command::Search { query, limit } => {
      let dataset = load_dataset(&open_store(&config)?)?;
      let search_config = SearchConfig {
        max_results: limit.unwrap_or(config.search.max_results),
        ..config.search.clone()
      };

      match query {
        Some(query) => {
          print_results(&search(&dataset, &query, search_config.max_results));
          Ok(())
        }
        None => search_stdin(dataset, &search_config).await,
      }
    }
    Command::Status => {
      let store = open_store(&config)?;
      for layer in Layer::ALL {
        let synced = match store.get_timestamp(layer)? {
          Some(at) => at.to_rfc3339(),
          None => "never".to_string(),
        };
        let state = if store.is_stale(layer)? { "stale" } else { "fresh" };
        println!(
          "{:<8} {:>8} rows  {:<6} synced {}",
          layer,
          store.count(layer)?,
          state,
          synced
        );
      }
      let markers = open_markers(&config)?;
      match markers.stored_hash()? {
        Some(hash) => println!("markers  fingerprint {}", hash),
        None => println!("markers  none cached"),
      }
      Ok(())
    }
    Command::Clear { layer } => {
      let store = open_store(&config)?;
      match layer {
        Some(name) => {
          let layer = Layer::parse(&name).ok_or_else(|| eyre!("Unknown layer: {}", name))?;
          store.clear_layer(layer)?;
          println!("Cleared {} layer", layer);
        }
        None => {
          for layer in Layer::ALL {
            store.clear_layer(layer)?;
          }
          open_markers(&config)?.clear()?;
          println!("Cleared all layers and markers");
        }
      }
      Ok(())
    }
    Command::Clusters { zoom, bbox } => {
      let bbox = match bbox {
        Some(s) => parse_bbox(&s)?,
        None => BBox::WORLD,
      };
      clusters(&config, bbox, zoom).await
    }
  }
}

fn print_results(found: &SearchResults) {
  println!("{} of {} matches", found.results.len(), found.total);
  for hit in &found.results {
    let r = &hit.entity.record;
    println!(
      "{:>4}  {:<12} {:<10} {}",
      hit.score,
      hit.field.label(),
      r.electro_id.as_deref().unwrap_or("-"),
      r.address.as_deref().unwrap_or("")
    );
  }
}

/// Treat stdin lines as keystrokes: only queries that survive the debounce
/// window are printed.
async fn search_stdin(dataset: Vec<UnifiedEntity>, config: &SearchConfig) -> Result<()> {
  let mut debounced = DebouncedSearch::from_config(Arc::new(dataset), config);
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut tick = tokio::time::interval(Duration::from_millis(config.debounce_ms.max(1)));
  let mut open = true;

  loop {
    tokio::select! {
      line = lines.next_line(), if open => match line? {
        Some(query) => debounced.search(query.trim()),
        None => open = false,
      },
      _ = tick.tick() => {
        if debounced.poll() {
          if let (Some(query), Some(found)) = (debounced.query(), debounced.results()) {
            println!("> {}", query);
            print_results(found);
          }
        }
        if !open && !debounced.is_pending() {
          return Ok(());
        }
      }
    }
  }
}

async fn sync(config: &Config) -> Result<()> {
  let source = HttpLayerSource::new(&config.api)?;
  let sync_config = SyncConfig::from_config(config);

  if config.cache.enabled {
    let store = open_store(config)?;
    let markers = open_markers(config)?;
    run_sync(SyncOrchestrator::new(store, source, sync_config).with_marker_cache(markers)).await
  } else {
    run_sync(SyncOrchestrator::new(NoopLayerStore, source, sync_config)).await
  }
}

async fn run_sync<S: LayerStore>(mut sync: SyncOrchestrator<S, HttpLayerSource>) -> Result<()> {
  let mut progress = sync.subscribe_progress();
  let printer = tokio::spawn(async move {
    while progress.changed().await.is_ok() {
      let current = *progress.borrow_and_update();
      if let Some(p) = current {
        eprintln!("{}", p);
      }
    }
  });

  let result = sync.run().await;
  // Closes the progress channel so the printer exits.
  drop(sync);
  let _ = printer.await;

  let report = result?;
  for layer in &report.layers {
    if layer.skipped {
      println!("{:<8} up to date", layer.layer);
    } else {
      println!(
        "{:<8} fetched {} rows from offset {}",
        layer.layer, layer.fetched, layer.start_offset
      );
    }
  }
  println!(
    "{} records, {} markers{}",
    report.entities,
    report.markers,
    if report.markers_rebuilt { " (rebuilt)" } else { "" }
  );
  Ok(())
}

async fn clusters(config: &Config, bbox: BBox, zoom: f64) -> Result<()> {
  let markers = open_markers(config)?;
  let points = match markers.load_markers()? {
    Some(points) => points,
    None => derive_markers(&load_dataset(&open_store(config)?)?),
  };
  let filters = markers.load_filters()?.unwrap_or_default();

  let client = ClusterClient::spawn(config.map.cluster_options())?;
  client.init(points, filters.clone()).await?;
  let (features, total) = client.get_clusters(bbox, zoom, filters).await?;

  println!("{} features, {} markers pass filters", features.len(), total);
  for feature in &features {
    match feature {
      ClusterFeature::Cluster {
        cluster_id,
        lat,
        lng,
        point_count,
      } => {
        let expands_at = client.get_cluster_expansion_zoom(*cluster_id).await?;
        println!(
          "cluster {:>8}  {:>5} markers  ({:.5}, {:.5})  expands at z{}",
          cluster_id, point_count, lat, lng, expands_at
        );
      }
      ClusterFeature::Point(marker) => {
        println!(
          "marker  {:>8}  ({:.5}, {:.5})  {}",
          marker.id,
          marker.lat,
          marker.lng,
          marker.address.as_deref().unwrap_or("")
        );
      }
    }
  }
  Ok(())
}

fn open_store(config: &Config) -> Result<SqliteLayerStore> {
  if !config.cache.enabled {
    return Err(eyre!("The cache is disabled in the configuration"));
  }
  SqliteLayerStore::open(&config.cache.layer_db_path()?)
}

fn open_markers(config: &Config) -> Result<MarkerCache> {
  MarkerCache::open(&config.cache.marker_db_path()?)
}

fn load_dataset(store: &SqliteLayerStore) -> Result<Vec<UnifiedEntity>> {
  let main: Vec<EquipmentRecord> = store.get_all()?;
  let panels: Vec<PanelRecord> = store.get_all()?;
  let partners: Vec<PartnerRecord> = store.get_all()?;
  Ok(stack_layers(&main, &panels, &partners))
}

fn parse_bbox(s: &str) -> Result<BBox> {
  let parts: Vec<f64> = s
    .split(',')
    .map(|p| p.trim().parse::<f64>())
    .collect::<std::result::Result<_, _>>()
    .map_err(|e| eyre!("Invalid bbox {}: {}", s, e))?;

  match parts.as_slice() {
    [west, south, east, north] => Ok(BBox::new(*west, *south, *east, *north)),
    _ => Err(eyre!("bbox needs four comma-separated numbers, got {}", s)),
  }
}
