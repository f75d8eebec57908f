//! Disc detection.
//!
//! Polls the drive and turns each newly inserted disc into a Pending queue
//! item. A disc stays "current" until it is removed, so it is queued once
//! no matter how many polls see it. Discs are told apart by device and raw
//! label, so disc 2 of a set is a new disc even while disc 1 is queued.

use super::model::{DiscInfo, DiscType};
use super::ripper::DiscError;
use super::robot::parse_drives;
use super::selection::parse_label_hints;
use crate::queue::{QueueError, QueueItem, QueueStatus, QueueStore};
use crate::tool::run_tool;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Disc(#[from] DiscError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Reports what is in a drive right now.
#[async_trait]
pub trait DiscProbe: Send + Sync {
    /// `None` when the drive is empty.
    async fn probe(&self, device: &str) -> Result<Option<DiscInfo>, DiscError>;
}

/// Probes drives through `makemkvcon`'s drive listing.
#[derive(Debug, Clone)]
pub struct MakemkvDriveProbe {
    binary: String,
    timeout: Duration,
}

impl MakemkvDriveProbe {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// `makemkvcon -r --cache=1 info disc:9999` lists drives without scanning.
    pub fn build_probe_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-r").arg("--cache=1").arg("info").arg("disc:9999");
        cmd
    }
}

/// Finds `device` in a drive listing.
pub(crate) fn disc_in_drive_listing(output: &str, device: &str) -> Result<Option<DiscInfo>, DiscError> {
    let drive = parse_drives(output)
        .into_iter()
        .find(|d| d.device == device)
        .ok_or_else(|| DiscError::Hardware(format!("drive {} not found", device)))?;

    if !drive.has_disc() {
        return Ok(None);
    }

    Ok(Some(DiscInfo {
        device: device.to_string(),
        disc_type: DiscType::Unknown,
        label: drive.disc_name,
    }))
}

#[async_trait]
impl DiscProbe for MakemkvDriveProbe {
    async fn probe(&self, device: &str) -> Result<Option<DiscInfo>, DiscError> {
        let output = run_tool(self.build_probe_command(), Some(self.timeout), |_| {}).await?;
        disc_in_drive_listing(&output.stdout_text(), device)
    }
}

/// Polls one drive and enqueues new discs.
pub struct DiscMonitor {
    probe: Arc<dyn DiscProbe>,
    store: Arc<QueueStore>,
    device: String,
    interval: Duration,
    notify: Arc<Notify>,
    current: Option<DiscInfo>,
    /// Set once the drive has been seen empty since startup.
    seen_empty: bool,
}

impl DiscMonitor {
    pub fn new(
        probe: Arc<dyn DiscProbe>,
        store: Arc<QueueStore>,
        device: impl Into<String>,
        interval: Duration,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            probe,
            store,
            device: device.into(),
            interval,
            notify,
            current: None,
            seen_empty: false,
        }
    }

    /// One detection pass. Returns the item created, if any.
    pub async fn poll_once(&mut self) -> Result<Option<QueueItem>, MonitorError> {
        let Some(disc) = self.probe.probe(&self.device).await? else {
            if let Some(previous) = self.current.take() {
                info!(device = %self.device, label = %previous.label, "Disc removed");
            }
            self.seen_empty = true;
            return Ok(None);
        };

        if self.current.as_ref() == Some(&disc) {
            return Ok(None);
        }

        if self.store.has_active_item_for_disc(&disc)? {
            debug!(device = %self.device, label = %disc.label, "Disc already queued");
            self.current = Some(disc);
            return Ok(None);
        }

        // A finished disc left in the drive across a restart.
        if !self.seen_empty {
            let finished = self
                .store
                .latest_item_for_disc(&disc)?
                .is_some_and(|item| item.status == QueueStatus::Completed);
            if finished {
                info!(device = %self.device, label = %disc.label, "Disc already completed, waiting for removal");
                self.current = Some(disc);
                return Ok(None);
            }
        }

        info!(device = %self.device, label = %disc.label, "Disc detected");
        let item = self.store.add_disc(&disc_title_for(&disc), &disc)?;

        self.current = Some(disc);
        self.notify.notify_one();
        Ok(Some(item))
    }

    /// Polls until `shutdown` flips to true. Failures are logged and polling
    /// continues.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(device = %self.device, interval_secs = self.interval.as_secs(), "Disc monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(device = %self.device, error = %e, "Disc detection failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(device = %self.device, "Disc monitor stopped");
    }
}

/// Queue title for a disc: the cleaned up label, or the raw label if
/// cleaning leaves nothing.
fn disc_title_for(disc: &DiscInfo) -> String {
    let hints = parse_label_hints(&disc.label);
    if !hints.title.is_empty() {
        hints.title
    } else if !disc.label.trim().is_empty() {
        disc.label.trim().to_string()
    } else {
        format!("Disc in {}", disc.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStatus;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Returns queued answers in order, then keeps repeating the last one.
    struct ScriptedProbe {
        answers: Mutex<Vec<Result<Option<DiscInfo>, String>>>,
    }

    impl ScriptedProbe {
        fn new(answers: Vec<Result<Option<DiscInfo>, String>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into_iter().rev().collect()),
            })
        }
    }

    #[async_trait]
    impl DiscProbe for ScriptedProbe {
        async fn probe(&self, _device: &str) -> Result<Option<DiscInfo>, DiscError> {
            let mut answers = self.answers.lock().unwrap();
            let answer = if answers.len() > 1 {
                answers.pop().unwrap()
            } else {
                answers.last().cloned().unwrap_or(Ok(None))
            };
            answer.map_err(DiscError::Hardware)
        }
    }

    fn disc(label: &str) -> DiscInfo {
        DiscInfo {
            device: "/dev/sr0".to_string(),
            disc_type: DiscType::Unknown,
            label: label.to_string(),
        }
    }

    fn monitor(probe: Arc<ScriptedProbe>, store: Arc<QueueStore>) -> DiscMonitor {
        DiscMonitor::new(
            probe,
            store,
            "/dev/sr0",
            Duration::from_millis(10),
            Arc::new(Notify::new()),
        )
    }

    #[test]
    fn test_drive_listing_command_args() {
        let probe = MakemkvDriveProbe::new("makemkvcon", Duration::from_secs(30));
        let args: Vec<String> = probe
            .build_probe_command()
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args, vec!["-r", "--cache=1", "info", "disc:9999"]);
    }

    #[test]
    fn test_drive_listing() {
        let output = concat!(
            "DRV:0,2,999,1,\"BD-RE HL-DT-ST BD-RE  WH16NS60\",\"HEAT_DISC_1\",\"/dev/sr0\"\n",
            "DRV:1,0,999,0,\"DVD+R-DL ASUS\",\"\",\"/dev/sr1\"\n",
            "DRV:2,256,999,0,\"\",\"\",\"\"\n",
        );

        let found = disc_in_drive_listing(output, "/dev/sr0").unwrap().unwrap();
        assert_eq!(found.label, "HEAT_DISC_1");
        assert_eq!(found.device, "/dev/sr0");

        assert!(disc_in_drive_listing(output, "/dev/sr1").unwrap().is_none());
        assert!(matches!(
            disc_in_drive_listing(output, "/dev/sr5"),
            Err(DiscError::Hardware(_))
        ));
    }

    #[test]
    fn test_disc_title_for() {
        assert_eq!(disc_title_for(&disc("SHOW_NAME_S2_D1")), "Show Name");
        assert_eq!(disc_title_for(&disc("  ")), "Disc in /dev/sr0");
    }

    #[tokio::test]
    async fn test_new_disc_is_queued_once() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(tmp.path()).unwrap());
        let probe = ScriptedProbe::new(vec![Ok(Some(disc("HEAT"))), Ok(Some(disc("HEAT")))]);
        let mut monitor = monitor(probe, Arc::clone(&store));

        let item = monitor.poll_once().await.unwrap().expect("item created");
        assert_eq!(item.disc_title, "Heat");
        assert_eq!(item.status, QueueStatus::Pending);

        let spec = store.get(item.item_id).unwrap().unwrap().rip_spec().unwrap().unwrap();
        assert_eq!(spec.disc.label, "HEAT");
        assert_eq!(spec.item_id, item.item_id);

        assert!(monitor.poll_once().await.unwrap().is_none());
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reinserted_disc_with_active_item_is_not_duplicated() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(tmp.path()).unwrap());
        store.add_disc("Heat", &disc("HEAT")).unwrap();

        let probe = ScriptedProbe::new(vec![Ok(Some(disc("HEAT")))]);
        let mut monitor = monitor(probe, Arc::clone(&store));
        assert!(monitor.poll_once().await.unwrap().is_none());
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_next_disc_of_a_set_is_queued_while_first_is_in_review() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(tmp.path()).unwrap());
        let mut first = store.add_disc("Show Name", &disc("SHOW_NAME_S1_D1")).unwrap();
        first.status = QueueStatus::Review;
        store.update(&first).unwrap();

        let probe = ScriptedProbe::new(vec![Ok(Some(disc("SHOW_NAME_S1_D2")))]);
        let mut monitor = monitor(probe, Arc::clone(&store));
        let second = monitor.poll_once().await.unwrap().expect("disc 2 queued");

        assert_eq!(second.disc_title, "Show Name");
        assert_eq!(second.disc_label, "SHOW_NAME_S1_D2");
        assert_eq!(second.device, "/dev/sr0");
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_completed_disc_left_in_drive_is_not_requeued_after_restart() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(tmp.path()).unwrap());
        let mut done = store.add_disc("Heat", &disc("HEAT")).unwrap();
        done.status = QueueStatus::Completed;
        store.update(&done).unwrap();

        let probe = ScriptedProbe::new(vec![
            Ok(Some(disc("HEAT"))),
            Ok(None),
            Ok(Some(disc("HEAT"))),
        ]);
        let mut monitor = monitor(probe, Arc::clone(&store));

        assert!(monitor.poll_once().await.unwrap().is_none());
        assert_eq!(store.all().unwrap().len(), 1);

        // Taken out and put back in: rip it again.
        assert!(monitor.poll_once().await.unwrap().is_none());
        assert!(monitor.poll_once().await.unwrap().is_some());
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_disc_left_in_drive_is_retried_after_restart() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(tmp.path()).unwrap());
        let mut failed = store.add_disc("Heat", &disc("HEAT")).unwrap();
        failed.fail("rip failed");
        store.update(&failed).unwrap();

        let probe = ScriptedProbe::new(vec![Ok(Some(disc("HEAT")))]);
        let mut monitor = monitor(probe, Arc::clone(&store));
        assert!(monitor.poll_once().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disc_swap_queues_both() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(tmp.path()).unwrap());
        let probe = ScriptedProbe::new(vec![
            Ok(Some(disc("HEAT"))),
            Ok(None),
            Ok(Some(disc("RONIN"))),
        ]);
        let mut monitor = monitor(probe, Arc::clone(&store));

        assert!(monitor.poll_once().await.unwrap().is_some());
        assert!(monitor.poll_once().await.unwrap().is_none());
        assert!(monitor.poll_once().await.unwrap().is_some());

        let titles: Vec<String> = store.all().unwrap().into_iter().map(|i| i.disc_title).collect();
        assert_eq!(titles, vec!["Heat", "Ronin"]);
    }

    #[tokio::test]
    async fn test_detection_failures_do_not_stop_monitor() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(tmp.path()).unwrap());
        let probe = ScriptedProbe::new(vec![
            Err("drive busy".to_string()),
            Ok(Some(disc("HEAT"))),
        ]);
        let monitor = monitor(probe, Arc::clone(&store));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(rx));

        let mut queued = false;
        for _ in 0..100 {
            if !store.all().unwrap().is_empty() {
                queued = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(queued, "monitor should recover after a failed probe");
        assert_eq!(store.all().unwrap().len(), 1);
    }
}
