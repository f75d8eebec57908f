//! Daemon startup and main loop.
//!
//! Wires the queue store, the workflow and the disc monitor together and
//! runs them as tokio tasks until shutdown.

use crate::config::{Config, ConfigError};
use crate::disc::{DiscMonitor, DiscProbe, DiscRipper, MakemkvDriveProbe, MakemkvRipper, RipperSettings};
use crate::encode::{CommandEncoder, Encoder};
use crate::identify::{Identifier, NullIdentifier};
use crate::organize::{LibraryOrganizer, Organizer};
use crate::queue::{QueueError, QueueItem, QueueStatus, QueueStore};
use crate::startup::{prepare_directories, run_startup_checks, StartupError};
use crate::status_server::run_status_server;
use crate::workflow::{Workflow, WorkflowSettings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Statuses the processing worker picks up.
const PROCESSING_STATUSES: [QueueStatus; 3] = [
    QueueStatus::Ripped,
    QueueStatus::Identified,
    QueueStatus::Encoded,
];

/// The stage implementations the daemon drives.
pub struct Collaborators {
    pub probe: Arc<dyn DiscProbe>,
    pub ripper: Arc<dyn DiscRipper>,
    pub identifier: Arc<dyn Identifier>,
    pub encoder: Arc<dyn Encoder>,
    pub organizer: Arc<dyn Organizer>,
}

impl Collaborators {
    /// MakeMKV, the configured encoder and the library tree. No lookup
    /// service is wired in, so every disc is parked for review.
    pub fn from_config(config: &Config) -> Self {
        Self {
            probe: Arc::new(MakemkvDriveProbe::new(
                config.makemkv.binary.clone(),
                config.scan_timeout(),
            )),
            ripper: Arc::new(MakemkvRipper::new(RipperSettings::from_config(config))),
            identifier: Arc::new(NullIdentifier),
            encoder: Arc::new(CommandEncoder::from_config(config)),
            organizer: Arc::new(LibraryOrganizer::from_config(config)),
        }
    }
}

pub struct Daemon {
    pub config: Config,
    store: Arc<QueueStore>,
    workflow: Arc<Workflow>,
    probe: Arc<dyn DiscProbe>,
    rip_notify: Arc<Notify>,
    process_notify: Arc<Notify>,
}

impl Daemon {
    /// Loads and validates the config at `config_path`, checks the external
    /// tools unless `skip_checks` is set, then opens the queue.
    pub fn new<P: AsRef<Path>>(config_path: P, skip_checks: bool) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        config.validate()?;

        if skip_checks {
            warn!("Skipping tool availability checks");
        } else {
            run_startup_checks(&config)?;
        }

        Self::new_without_checks(config)
    }

    /// Builds the daemon with the default collaborators and no tool checks.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let collaborators = Collaborators::from_config(&config);
        Self::with_collaborators(config, collaborators)
    }

    /// Builds the daemon around the given stage implementations.
    ///
    /// Items left mid-stage by a previous run are reset to Pending here,
    /// before any worker exists.
    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self, DaemonError> {
        prepare_directories(&config)?;

        let store = Arc::new(QueueStore::open(config.paths.state_dir.clone())?);
        let reset = store.reset_stuck_processing_items()?;
        if reset > 0 {
            info!(count = reset, "Reset interrupted items");
        }

        let workflow = Arc::new(Workflow::new(
            Arc::clone(&store),
            collaborators.ripper,
            collaborators.identifier,
            collaborators.encoder,
            collaborators.organizer,
            WorkflowSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            store,
            workflow,
            probe: collaborators.probe,
            rip_notify: Arc::new(Notify::new()),
            process_notify: Arc::new(Notify::new()),
        })
    }

    pub fn store(&self) -> Arc<QueueStore> {
        Arc::clone(&self.store)
    }

    /// Starts the status server as a background task.
    pub fn start_status_server(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.store();
        let bind = self.config.status.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(store, &bind, shutdown).await {
                error!(error = %e, "Status server error");
            }
        })
    }

    /// Runs the monitor and both workers until `shutdown` flips to true.
    ///
    /// Workers finish the step they are in before exiting.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), DaemonError> {
        let tick = self.config.poll_interval();
        info!(
            device = %self.config.drive.device,
            state_dir = %self.config.paths.state_dir.display(),
            "Spindle daemon starting"
        );

        let monitor = DiscMonitor::new(
            Arc::clone(&self.probe),
            self.store(),
            self.config.drive.device.clone(),
            tick,
            Arc::clone(&self.rip_notify),
        );
        let mut handles = vec![tokio::spawn(monitor.run(shutdown.clone()))];

        handles.push(tokio::spawn(rip_worker(
            Arc::clone(&self.workflow),
            Arc::clone(&self.rip_notify),
            Arc::clone(&self.process_notify),
            tick,
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(processing_worker(
            Arc::clone(&self.workflow),
            Arc::clone(&self.process_notify),
            tick,
            shutdown.clone(),
        )));

        if self.config.status.enabled {
            handles.push(self.start_status_server(shutdown.clone()));
        }

        for handle in handles {
            handle.await?;
        }

        info!("Spindle daemon stopped");
        Ok(())
    }
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleeps until notified, the next tick, or shutdown. Returns false on
/// shutdown.
async fn wait_for_work(notify: &Notify, tick: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if is_shutdown(shutdown) {
        return false;
    }
    tokio::select! {
        _ = notify.notified() => true,
        _ = tokio::time::sleep(tick) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

async fn load_items(workflow: &Workflow, statuses: &[QueueStatus]) -> Vec<QueueItem> {
    match workflow.store().run_blocking(|store| store.all()).await {
        Ok(items) => items
            .into_iter()
            .filter(|item| statuses.contains(&item.status))
            .collect(),
        Err(e) => {
            error!(error = %e, "Could not read queue");
            Vec::new()
        }
    }
}

/// Rips Pending items one at a time, oldest first.
async fn rip_worker(
    workflow: Arc<Workflow>,
    notify: Arc<Notify>,
    process_notify: Arc<Notify>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Rip worker started");
    loop {
        for item in load_items(&workflow, &[QueueStatus::Pending]).await {
            if is_shutdown(&shutdown) {
                break;
            }
            let item = workflow.advance(item).await;
            if item.status == QueueStatus::Ripped {
                process_notify.notify_one();
            }
        }

        if !wait_for_work(&notify, tick, &mut shutdown).await {
            break;
        }
    }
    info!("Rip worker stopped");
}

/// Takes ripped items through identification, encoding and filing.
async fn processing_worker(
    workflow: Arc<Workflow>,
    notify: Arc<Notify>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Processing worker started");
    loop {
        for mut item in load_items(&workflow, &PROCESSING_STATUSES).await {
            while PROCESSING_STATUSES.contains(&item.status) && !is_shutdown(&shutdown) {
                let before = item.status;
                item = workflow.advance(item).await;
                if item.status == before {
                    break;
                }
            }
            if is_shutdown(&shutdown) {
                break;
            }
        }

        if !wait_for_work(&notify, tick, &mut shutdown).await {
            break;
        }
    }
    info!("Processing worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::model::fixtures;
    use crate::disc::{DiscError, DiscInfo, DiscScan, DiscType, RipProgress, Title};
    use crate::encode::{EncodeError, EncodeEvent, EncodeRequest};
    use crate::identify::{Identification, IdentifyError, IdentifyRequest, MediaInfo, MediaType};
    use async_trait::async_trait;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct LoadedDrive;

    #[async_trait]
    impl DiscProbe for LoadedDrive {
        async fn probe(&self, device: &str) -> Result<Option<DiscInfo>, DiscError> {
            Ok(Some(DiscInfo {
                device: device.to_string(),
                disc_type: DiscType::BluRay,
                label: "HEAT".to_string(),
            }))
        }
    }

    struct FileRipper;

    #[async_trait]
    impl DiscRipper for FileRipper {
        async fn scan_disc(&self, _device: &str) -> Result<DiscScan, DiscError> {
            Ok(DiscScan {
                disc_type: DiscType::BluRay,
                disc_name: Some("HEAT".to_string()),
                volume_name: Some("HEAT".to_string()),
                titles: vec![fixtures::title("0", 10_200), fixtures::title("1", 120)],
            })
        }

        async fn rip(
            &self,
            _device: &str,
            title: &Title,
            output_dir: &Path,
            progress: &mut (dyn FnMut(RipProgress) + Send),
        ) -> Result<PathBuf, DiscError> {
            progress(RipProgress {
                percent: 100.0,
                message: None,
            });
            let path = output_dir.join(format!("title_{}.mkv", title.id));
            fs::write(&path, b"ripped")?;
            Ok(path)
        }

        async fn eject(&self, _device: &str) -> Result<(), DiscError> {
            Ok(())
        }
    }

    struct KnownMovie;

    #[async_trait]
    impl Identifier for KnownMovie {
        async fn identify(&self, request: &IdentifyRequest) -> Result<Identification, IdentifyError> {
            Ok(Identification::Found(MediaInfo {
                title: request.title.clone(),
                year: Some(1995),
                media_type: MediaType::Movie,
                tmdb_id: 949,
                overview: String::new(),
                genres: Vec::new(),
                runtime: None,
                season: None,
                episode: None,
                episode_title: None,
                confidence: 0.95,
            }))
        }
    }

    struct CopyEncoder;

    #[async_trait]
    impl Encoder for CopyEncoder {
        async fn encode(
            &self,
            request: &EncodeRequest,
            on_event: &mut (dyn FnMut(EncodeEvent) + Send),
        ) -> Result<PathBuf, EncodeError> {
            fs::create_dir_all(&request.output_dir)?;
            let output = request.output_dir.join("encoded.mkv");
            fs::copy(&request.input, &output)?;
            on_event(EncodeEvent::Completed {
                message: None,
                output_file: output.clone(),
                size_reduction_percent: None,
            });
            Ok(output)
        }
    }

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.paths.staging_dir = root.join("staging");
        config.paths.library_dir = root.join("library");
        config.paths.state_dir = root.join("state");
        config.drive.poll_interval_secs = 1;
        config.status.enabled = false;
        config
    }

    fn collaborators(config: &Config, identifier: Arc<dyn Identifier>) -> Collaborators {
        Collaborators {
            probe: Arc::new(LoadedDrive),
            ripper: Arc::new(FileRipper),
            identifier,
            encoder: Arc::new(CopyEncoder),
            organizer: Arc::new(LibraryOrganizer::from_config(config)),
        }
    }

    async fn wait_for_status(store: &QueueStore, status: QueueStatus) -> QueueItem {
        for _ in 0..200 {
            if let Some(item) = store.all().unwrap().into_iter().find(|i| i.status == status) {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no item reached {}: {:?}", status, store.all().unwrap());
    }

    #[test]
    fn test_new_rejects_missing_config() {
        let tmp = TempDir::new().unwrap();
        let result = Daemon::new(tmp.path().join("missing.toml"), true);
        assert!(matches!(result, Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("spindle.toml");
        fs::write(&path, "[identification]\nconfidence_threshold = 3.0\n").unwrap();
        let result = Daemon::new(&path, true);
        assert!(matches!(result, Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_startup_resets_interrupted_items() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        {
            let store = QueueStore::open(&config.paths.state_dir).unwrap();
            let mut item = store.add("HEAT").unwrap();
            item.status = QueueStatus::Encoding;
            store.update(&item).unwrap();
        }

        let daemon = Daemon::new_without_checks(config).unwrap();
        let items = daemon.store().all().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Pending);
        assert!(daemon.config.paths.staging_dir.is_dir());
    }

    #[tokio::test]
    async fn test_detected_disc_runs_to_completion() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        let parts = collaborators(&config, Arc::new(KnownMovie));
        let daemon = Daemon::with_collaborators(config, parts).unwrap();
        let store = daemon.store();

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { daemon.run(rx).await });

        let item = wait_for_status(&store, QueueStatus::Completed).await;
        let final_file = item.final_file.expect("completed item has a library file");
        assert!(final_file.ends_with("Movies/Heat (1995)/Heat (1995).mkv"));
        assert!(final_file.exists());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("daemon should stop")
            .unwrap()
            .unwrap();

        // The disc stays in the drive but is only queued once.
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unidentified_disc_waits_for_review() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        let parts = collaborators(&config, Arc::new(NullIdentifier));
        let daemon = Daemon::with_collaborators(config, parts).unwrap();
        let store = daemon.store();

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { daemon.run(rx).await });

        let item = wait_for_status(&store, QueueStatus::Review).await;
        assert!(item.ripped_file.is_some());
        assert!(item.final_file.is_none());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("daemon should stop")
            .unwrap()
            .unwrap();
    }
}
