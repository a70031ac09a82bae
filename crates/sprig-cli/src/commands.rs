use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sprig_bus::{BusConfig, EventBus};
use sprig_config::{DeviceKind, DeviceSpec, SiteConfig};
use sprig_device::{
    Device, DeviceRegistry, SimulatedController, SimulatedPump, SimulatedSensor,
};
use sprig_domain::{Connection, DeviceId};
use sprig_persist::{PersistConfig, PersistenceService};
use sprig_resilience::{
    BreakerConfig, BreakerRegistry, CommunicationBackoffStrategy, DeviceRestartStrategy,
    ErrorMonitor, RecoveryOrchestrator, ReinitializeStrategy,
};
use sprig_store::{JsonFileStore, MemoryEventStore, MemoryStore, PropertyStore};
use sprig_topology::TopologyService;
use tracing::{info, warn};

use crate::cli::GraphOutput;
use crate::output;

const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const RECOVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Construct the full object graph, attach the site's devices and spin
/// until ctrl-c.
pub async fn run(
    site_dir: PathBuf,
    store_path: PathBuf,
    batch_interval_ms: u64,
    dispatch_workers: usize,
) -> Result<()> {
    let site = sprig_config::load_site(&site_dir)
        .with_context(|| format!("loading site from {}", site_dir.display()))?;
    info!(
        devices = site.devices.len(),
        connections = site.connections.len(),
        "site loaded"
    );

    // Construction order: store, monitor, breakers, bus, topology,
    // persistence, recovery.
    let store: Arc<dyn PropertyStore> = Arc::new(
        JsonFileStore::open(&store_path)
            .with_context(|| format!("opening store at {}", store_path.display()))?,
    );
    let monitor = Arc::new(ErrorMonitor::default());
    let breakers = Arc::new(BreakerRegistry::new(
        BreakerConfig::default(),
        Some(monitor.clone()),
    ));
    let bus = Arc::new(EventBus::new(
        Arc::new(MemoryEventStore::new()),
        Some(monitor.clone()),
        BusConfig {
            dispatch_concurrency: dispatch_workers,
        },
    ));

    let topology = Arc::new(TopologyService::new(store.clone()));
    topology.initialize().await?;
    sync_topology(&topology, &site.connections).await?;
    bus.set_topology(topology.clone()).await;

    let registry = Arc::new(DeviceRegistry::new());
    let persistence = PersistenceService::new(
        store.clone(),
        bus.clone(),
        monitor.clone(),
        breakers.clone(),
        registry.clone(),
        PersistConfig {
            batch_interval: Duration::from_millis(batch_interval_ms),
        },
    );
    persistence.start().await;
    topology.set_property_reader(persistence.clone()).await;

    let recovery = Arc::new(RecoveryOrchestrator::new(monitor.clone()));
    recovery.register_strategy(Arc::new(CommunicationBackoffStrategy::default()));
    recovery.register_strategy(Arc::new(DeviceRestartStrategy::new(registry.clone())));
    recovery.register_strategy(Arc::new(ReinitializeStrategy::new(
        registry.clone(),
        persistence.clone(),
    )));
    recovery.set_alert_sink(bus.clone());
    recovery.spawn_sweep_loop(RECOVERY_SWEEP_INTERVAL);

    // Devices: construct, attach (initialize or rehydrate), apply the
    // config's initial values, start.
    for spec in &site.devices {
        let device = build_device(spec);
        persistence
            .attach(device.clone())
            .await
            .with_context(|| format!("attaching device '{}'", spec.name))?;

        for (name, value) in &spec.properties {
            let metadata = spec.metadata.get(name).cloned();
            device
                .properties()
                .set_property(name, value.clone(), metadata)
                .await;
        }

        if let Err(e) = device.start().await {
            warn!(device = spec.name, error = %e, "device failed to start");
        }
    }

    bus.spawn_retry_loop(RETRY_SWEEP_INTERVAL);
    info!(store = %store_path.display(), "sprig running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    for device in registry.all() {
        if let Err(e) = device.stop().await {
            warn!(device = device.name(), error = %e, "device failed to stop");
        }
    }
    recovery.shutdown();
    persistence.shutdown().await;
    bus.shutdown();

    let open_faults = monitor.active_errors(None).await;
    if !open_faults.is_empty() {
        warn!(count = open_faults.len(), "shutting down with active faults");
    }
    Ok(())
}

/// Render the site topology without running anything.
pub async fn graph(site_dir: PathBuf, format: GraphOutput) -> Result<()> {
    let site = sprig_config::load_site(&site_dir)
        .with_context(|| format!("loading site from {}", site_dir.display()))?;

    // An in-memory topology is enough for rendering.
    let topology = TopologyService::new(Arc::new(MemoryStore::new()));
    for connection in &site.connections {
        topology.create(connection.clone()).await?;
    }
    let analysis = topology.analyze().await;
    let names = device_names(&site);

    let rendered = match format {
        GraphOutput::Text => output::render_text(&site.connections, &analysis, &names),
        GraphOutput::Dot => output::render_dot(&site.connections, &names),
        GraphOutput::Json => output::render_json(&site.connections, &names)?,
    };
    println!("{}", rendered);
    Ok(())
}

/// List persisted components with their standard properties.
pub async fn status(store_path: PathBuf) -> Result<()> {
    let store = JsonFileStore::open(&store_path)
        .with_context(|| format!("opening store at {}", store_path.display()))?;

    let mut ids = store.list_ids().await?;
    ids.sort_by_key(|id| id.to_string());

    let mut rows = Vec::new();
    let mut connection_count = 0usize;
    for id in ids {
        if id == DeviceId::TOPOLOGY {
            if let Some(props) = store.load(&id).await? {
                connection_count = props
                    .get("Connections")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
            }
            continue;
        }
        if let Some(props) = store.load(&id).await? {
            rows.push((id, props));
        }
    }

    println!("{}", output::render_status(&rows, connection_count));
    Ok(())
}

fn build_device(spec: &DeviceSpec) -> Arc<dyn Device> {
    match spec.kind {
        DeviceKind::Pump => Arc::new(SimulatedPump::new(spec.id, spec.name.clone())),
        DeviceKind::Sensor => {
            let unit = spec
                .properties
                .get("Unit")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Arc::new(SimulatedSensor::new(spec.id, spec.name.clone(), unit))
        }
        DeviceKind::Controller => Arc::new(SimulatedController::new(spec.id, spec.name.clone())),
    }
}

/// Bring the persisted connection set in line with the site config.
///
/// Config connections get fresh ids on every load, so matching is by
/// `(source, target, type)`: missing edges are created, existing ones are
/// left alone (their persisted state may carry runtime edits).
async fn sync_topology(
    topology: &TopologyService,
    declared: &[Connection],
) -> Result<()> {
    let existing = topology.all().await;
    for connection in declared {
        let already = existing.iter().any(|c| {
            c.source_id == connection.source_id
                && c.target_id == connection.target_id
                && c.connection_type == connection.connection_type
        });
        if !already {
            topology.create(connection.clone()).await?;
        }
    }
    Ok(())
}

fn device_names(site: &SiteConfig) -> HashMap<DeviceId, String> {
    site.devices
        .iter()
        .map(|d| (d.id, d.name.clone()))
        .collect()
}
