//! Watch lifecycle: validation, attach/detach, activation and reload.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::aggregator::{ChangeAggregator, ChangeSet, Summary};
use crate::config::{ControllerOptions, ReloadSignal, WatchConfig};
use crate::error::{Result, ScheduleError, WatcherError};
use crate::event::FileEvent;
use crate::schedule::{CronSchedule, Occurrence, ScheduleEvaluator};
use crate::timer::{ActivationTimer, Clock, SystemClock, Transition, TransitionSink};
use crate::validation::{ValidationResult, validate};

/// Routes file events of one watch session into its aggregator and reacts
/// to activation transitions.
pub struct EventRouter {
    /// Watched root as configured.
    root: PathBuf,

    /// Canonical form of the root, when it differs. Some backends report
    /// events with symlinks resolved.
    canonical_root: Option<PathBuf>,

    /// Pending changes.
    aggregator: ChangeAggregator,

    /// Whether events are currently recorded.
    delivering: AtomicBool,

    /// Used to describe the window in logs.
    evaluator: ScheduleEvaluator,

    /// Fatal errors raised on the timer task.
    fatal_tx: mpsc::UnboundedSender<WatcherError>,
}

impl EventRouter {
    fn new(
        root: PathBuf,
        evaluator: ScheduleEvaluator,
        fatal_tx: mpsc::UnboundedSender<WatcherError>,
    ) -> Self {
        let canonical_root = std::fs::canonicalize(&root)
            .ok()
            .filter(|canonical| *canonical != root);

        Self {
            aggregator: ChangeAggregator::new(&root),
            root,
            canonical_root,
            delivering: AtomicBool::new(false),
            evaluator,
            fatal_tx,
        }
    }

    /// The watched root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The session's pending changes.
    pub fn aggregator(&self) -> &ChangeAggregator {
        &self.aggregator
    }

    /// Whether events are currently recorded.
    pub fn is_delivering(&self) -> bool {
        self.delivering.load(Ordering::SeqCst)
    }

    fn set_delivering(&self, delivering: bool) {
        self.delivering.store(delivering, Ordering::SeqCst);
    }

    /// Record an event. Directories and paths outside the root are ignored.
    pub fn route(&self, event: FileEvent) {
        if event.path().is_dir() {
            return;
        }

        match event {
            FileEvent::Created { path } => {
                if let Some(relative) = self.relative(&path) {
                    info!("created: {}", relative.display());
                    self.aggregator.add_created(relative);
                }
            }
            FileEvent::Changed { path } => {
                if let Some(relative) = self.relative(&path) {
                    debug!("changed: {}", relative.display());
                    self.aggregator.add_changed(relative);
                }
            }
            FileEvent::Deleted { path } => {
                if let Some(relative) = self.relative(&path) {
                    info!("deleted: {}", relative.display());
                    self.aggregator.add_deleted(relative);
                }
            }
            FileEvent::Renamed { from, to } => {
                if let (Some(old), Some(new)) = (self.relative(&from), self.relative(&to)) {
                    info!("renamed: {} -> {}", old.display(), new.display());
                    self.aggregator.rename(old, new);
                }
            }
        }
    }

    fn deliver(&self, event: notify::Event) {
        if !self.is_delivering() {
            return;
        }
        for event in FileEvent::from_notify(event) {
            self.route(event);
        }
    }

    fn relative(&self, path: &Path) -> Option<PathBuf> {
        let relative = path
            .strip_prefix(&self.root)
            .ok()
            .or_else(|| {
                self.canonical_root
                    .as_deref()
                    .and_then(|root| path.strip_prefix(root).ok())
            });

        match relative {
            Some(relative) if !relative.as_os_str().is_empty() => Some(relative.to_path_buf()),
            _ => {
                debug!("ignoring event outside {}: {}", self.root.display(), path.display());
                None
            }
        }
    }

    fn flush(&self) -> Summary {
        let summary = self.aggregator.flush();
        log_summary(&self.root, &summary);
        summary
    }
}

impl TransitionSink for EventRouter {
    fn on_transition(&self, transition: Transition, next: &Occurrence) {
        match transition {
            Transition::Activate => {
                self.set_delivering(true);
                match self.evaluator.day_window(next.local.date()) {
                    Some((start, end)) => info!(
                        "Watching '{}' on {} in window {} - {}",
                        self.root.display(),
                        next.local.format("%Y-%m-%d"),
                        start.format("%H:%M"),
                        end.format("%H:%M"),
                    ),
                    None => info!("Watching '{}'", self.root.display()),
                }
            }
            Transition::Deactivate => {
                self.set_delivering(false);
                info!(
                    "Watch window for '{}' closed until {}",
                    self.root.display(),
                    next.local.format("%Y-%m-%d %H:%M"),
                );
                self.flush();
            }
        }
    }

    fn on_error(&self, error: ScheduleError) {
        error!("activation timer for '{}' failed: {error}", self.root.display());
        if self.fatal_tx.send(WatcherError::Schedule(error)).is_err() {
            warn!("fatal error dropped, controller is no longer running");
        }
    }
}

fn log_summary(root: &Path, summary: &Summary) {
    if summary.is_empty() {
        info!("No changes recorded in '{}'", root.display());
        return;
    }
    for section in summary.sections() {
        info!("{section}");
    }
}

/// One attached watch: notification source, timer and pending changes.
struct Session {
    router: Arc<EventRouter>,
    watcher: Option<RecommendedWatcher>,
    timer: ActivationTimer,
}

impl Session {
    async fn close(mut self) -> Summary {
        self.timer.stop().await;
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.unwatch(&self.router.root) {
                debug!("failed to unwatch {}: {e}", self.router.root.display());
            }
        }
        self.router.set_delivering(false);
        self.router.flush()
    }
}

struct Inner {
    config: Option<WatchConfig>,
    validation: Option<ValidationResult>,
    session: Option<Session>,
    last_reload: Option<std::time::Instant>,
}

/// Result of handling a [`ReloadSignal`].
#[derive(Debug)]
pub enum ReloadOutcome {
    /// The signal came too soon after the last accepted one.
    Debounced,

    /// The new configuration is active.
    Restarted,

    /// The controller is idle until the next reload.
    Idle(WatcherError),
}

/// Drives a scheduled watch of one directory.
///
/// Start, stop and reload are serialized; a reload finishes stopping the
/// old session before the new one is attached.
pub struct WatchController {
    options: ControllerOptions,
    clock: Arc<dyn Clock>,
    inner: tokio::sync::Mutex<Inner>,
    fatal_tx: mpsc::UnboundedSender<WatcherError>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<WatcherError>>>,
}

impl WatchController {
    /// Create a controller for `config`. Nothing is attached until
    /// [`start`](Self::start).
    pub fn new(config: WatchConfig, options: ControllerOptions) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Self {
            options,
            clock: Arc::new(SystemClock),
            inner: tokio::sync::Mutex::new(Inner {
                config: Some(config),
                validation: None,
                session: None,
                last_reload: None,
            }),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
        }
    }

    /// Use a different clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate a configuration against this controller's base directory.
    pub fn validate(&self, config: &WatchConfig) -> ValidationResult {
        validate(config, &self.options.base_dir)
    }

    /// The most recent validation result.
    pub async fn validation(&self) -> Option<ValidationResult> {
        self.inner.lock().await.validation.clone()
    }

    /// Whether a session is attached.
    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.session.is_some()
    }

    /// Whether the watch window is open and events are recorded.
    pub async fn is_watching(&self) -> bool {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|session| session.router.is_delivering())
    }

    /// Pending changes of the attached session.
    pub async fn pending(&self) -> Option<ChangeSet> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.router.aggregator().snapshot())
    }

    /// Attach to the configured directory and start the activation timer.
    ///
    /// An invalid configuration or a failed attach leaves the controller
    /// idle and is reported as an error; neither is fatal.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner)
    }

    /// Detach, stop the timer and flush whatever is pending, even outside
    /// the watch window. Safe to call when nothing is running.
    pub async fn stop(&self) -> Summary {
        let mut inner = self.inner.lock().await;
        Self::stop_locked(&mut inner).await
    }

    /// Handle a configuration change.
    ///
    /// `load` is only called when the signal is not debounced.
    pub async fn reload<F>(&self, signal: ReloadSignal, load: F) -> ReloadOutcome
    where
        F: FnOnce() -> Result<WatchConfig>,
    {
        let mut inner = self.inner.lock().await;

        if let Some(last) = inner.last_reload {
            if signal.at.saturating_duration_since(last) < self.options.debounce {
                debug!("configuration change debounced");
                return ReloadOutcome::Debounced;
            }
        }
        inner.last_reload = Some(signal.at);

        info!("Configuration changed, reloading");
        Self::stop_locked(&mut inner).await;

        match load() {
            Ok(config) => {
                inner.config = Some(config);
                inner.validation = None;
            }
            Err(e) => {
                error!("Failed to load configuration, waiting for the next change: {e}");
                inner.config = None;
                inner.validation = None;
                return ReloadOutcome::Idle(e);
            }
        }

        match self.start_locked(&mut inner) {
            Ok(()) => {
                info!("Configuration reloaded, watcher restarted");
                ReloadOutcome::Restarted
            }
            Err(e) => {
                error!("Configuration rejected, waiting for the next change: {e}");
                ReloadOutcome::Idle(e)
            }
        }
    }

    /// Run until `shutdown` resolves, applying reload signals as they
    /// arrive. Returns an error only for failures that should end the
    /// process.
    pub async fn run<L, S>(
        &self,
        mut reloads: mpsc::Receiver<ReloadSignal>,
        load: L,
        shutdown: S,
    ) -> Result<()>
    where
        L: Fn() -> Result<WatchConfig>,
        S: Future<Output = ()>,
    {
        let mut fatal = self
            .fatal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| WatcherError::Config("controller is already running".to_string()))?;

        if let Err(e) = self.start().await {
            warn!("Watcher is idle, waiting for a configuration change: {e}");
        }

        tokio::pin!(shutdown);
        let mut reloads_open = true;
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Some(error) = fatal.recv() => return Err(error),
                signal = reloads.recv(), if reloads_open => match signal {
                    Some(signal) => {
                        self.reload(signal, &load).await;
                    }
                    None => {
                        debug!("reload channel closed");
                        reloads_open = false;
                    }
                },
            }
        }

        self.stop().await;
        Ok(())
    }

    fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.session.is_some() {
            return Ok(());
        }
        let config = inner
            .config
            .clone()
            .ok_or_else(|| WatcherError::Config("no configuration loaded".to_string()))?;

        let validation = self.validate(&config);
        inner.validation = Some(validation.clone());
        validation.into_result()?;

        let root = config.resolve_path(&self.options.base_dir);
        let evaluator =
            ScheduleEvaluator::new(CronSchedule::parse(&config.cron)?, self.options.offsets);
        let router = Arc::new(EventRouter::new(
            root.clone(),
            evaluator.clone(),
            self.fatal_tx.clone(),
        ));

        let watcher = attach(&root, router.clone())?;
        let timer = ActivationTimer::start(
            evaluator,
            self.clock.clone(),
            router.clone(),
            self.options.max_tick,
        )?;

        info!(
            "Watching '{}' on schedule '{}', waiting for the watch window",
            root.display(),
            config.cron
        );
        inner.session = Some(Session {
            router,
            watcher: Some(watcher),
            timer,
        });
        Ok(())
    }

    async fn stop_locked(inner: &mut Inner) -> Summary {
        match inner.session.take() {
            Some(session) => {
                let root = session.router.root().to_path_buf();
                let summary = session.close().await;
                info!("Stopped watching '{}'", root.display());
                summary
            }
            None => Summary::default(),
        }
    }
}

/// Subscribe to events under `root`. Events are dropped until the router
/// starts delivering.
fn attach(root: &Path, router: Arc<EventRouter>) -> Result<RecommendedWatcher> {
    let attach_error = |source: notify::Error| WatcherError::Attach {
        path: root.to_path_buf(),
        source,
    };

    let mut watcher = notify::recommended_watcher(
        move |res: std::result::Result<notify::Event, notify::Error>| match res {
            Ok(event) => router.deliver(event),
            Err(e) => error!("Watch error: {e}"),
        },
    )
    .map_err(attach_error)?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(attach_error)?;

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::OffsetSource;
    use crate::timer::tests::TokioClock;
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn options(base_dir: &Path) -> ControllerOptions {
        ControllerOptions::default()
            .with_base_dir(base_dir)
            .with_debounce(Duration::from_millis(1000))
            .with_offsets(OffsetSource::Fixed(FixedOffset::east_opt(0).unwrap()))
    }

    fn router(root: &Path) -> EventRouter {
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        EventRouter::new(
            root.to_path_buf(),
            ScheduleEvaluator::parse("* * * * *").unwrap(),
            fatal_tx,
        )
    }

    async fn wait_until_watching(controller: &WatchController) -> bool {
        for _ in 0..100 {
            if controller.is_watching().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_rename_of_created_file_is_reported_under_new_name() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let router = router(root);

        router.route(FileEvent::created(root.join("a.txt")));
        router.route(FileEvent::renamed(root.join("a.txt"), root.join("b.txt")));
        fs::write(root.join("b.txt"), "moved").unwrap();

        assert_eq!(
            router.flush(),
            Summary {
                created: vec![PathBuf::from("b.txt")],
                changed: Vec::new(),
                deleted: Vec::new(),
            }
        );
    }

    #[test]
    fn test_directories_and_foreign_paths_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("nested")).unwrap();
        let router = router(root);

        router.route(FileEvent::created(root.join("nested")));
        router.route(FileEvent::created("/elsewhere/file.txt"));
        router.route(FileEvent::changed(root));
        router.route(FileEvent::changed(root.join("nested/report.csv")));

        assert_eq!(
            router.aggregator().snapshot().changed,
            BTreeSet::from([PathBuf::from("nested/report.csv")])
        );
        assert!(router.aggregator().snapshot().created.is_empty());
    }

    #[test]
    fn test_events_are_dropped_while_not_delivering() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let router = router(root);
        let event = || {
            notify::Event::new(notify::EventKind::Create(notify::event::CreateKind::File))
                .add_path(root.join("early.txt"))
        };

        router.deliver(event());
        assert!(router.aggregator().is_empty());

        router.set_delivering(true);
        router.deliver(event());
        assert!(!router.aggregator().is_empty());
    }

    #[test]
    fn test_removed_directory_is_not_reported() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("nested")).unwrap();
        fs::remove_dir(root.join("nested")).unwrap();
        let router = router(root);
        router.set_delivering(true);

        router.deliver(
            notify::Event::new(notify::EventKind::Remove(notify::event::RemoveKind::Folder))
                .add_path(root.join("nested")),
        );

        assert_eq!(router.flush(), Summary::default());
    }

    #[test]
    fn test_attach_to_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");

        let result = attach(&missing, Arc::new(router(temp_dir.path())));
        assert!(matches!(result, Err(WatcherError::Attach { path, .. }) if path == missing));
    }

    #[tokio::test]
    async fn test_invalid_configuration_stays_idle() {
        let temp_dir = TempDir::new().unwrap();
        let controller = WatchController::new(
            WatchConfig::new("missing", "not a cron"),
            options(temp_dir.path()),
        );

        let result = controller.start().await;
        assert!(matches!(result, Err(WatcherError::Validation(errors)) if errors.len() == 2));
        assert!(!controller.is_running().await);

        let validation = controller.validation().await.unwrap();
        assert!(!validation.path_valid);
        assert!(!validation.cron_valid);
        assert_eq!(controller.stop().await, Summary::default());
    }

    #[tokio::test]
    async fn test_continuous_schedule_activates_and_stop_flushes() {
        let temp_dir = TempDir::new().unwrap();
        let controller =
            WatchController::new(WatchConfig::new(".", "* * * * *"), options(temp_dir.path()));

        controller.start().await.unwrap();
        assert!(controller.is_running().await);
        assert!(wait_until_watching(&controller).await);

        fs::write(temp_dir.path().join("kept.txt"), "").unwrap();
        {
            let inner = controller.inner.lock().await;
            let router = &inner.session.as_ref().unwrap().router;
            router.route(FileEvent::created(temp_dir.path().join("kept.txt")));
        }

        let summary = controller.stop().await;
        assert_eq!(summary.created, vec![PathBuf::from("kept.txt")]);
        assert!(!controller.is_running().await);
        assert!(!controller.is_watching().await);
    }

    #[tokio::test]
    async fn test_stop_flushes_outside_the_window() {
        let temp_dir = TempDir::new().unwrap();
        let controller =
            WatchController::new(WatchConfig::new(".", "0 9 * * *"), options(temp_dir.path()));
        controller.start().await.unwrap();
        assert!(!controller.is_watching().await);

        {
            let inner = controller.inner.lock().await;
            let router = &inner.session.as_ref().unwrap().router;
            router.route(FileEvent::deleted(temp_dir.path().join("straggler.txt")));
        }

        let summary = controller.stop().await;
        assert_eq!(summary.deleted, vec![PathBuf::from("straggler.txt")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_close_flushes_pending_changes() {
        let temp_dir = TempDir::new().unwrap();
        let controller =
            WatchController::new(WatchConfig::new(".", "* 9 * * *"), options(temp_dir.path()))
                .with_clock(TokioClock::at("2024-01-15 08:59:30"));

        controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert!(controller.is_watching().await);

        {
            let inner = controller.inner.lock().await;
            let router = &inner.session.as_ref().unwrap().router;
            router.route(FileEvent::deleted(temp_dir.path().join("gone.txt")));
        }
        assert_eq!(controller.pending().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert!(!controller.is_watching().await);
        assert!(controller.is_running().await);
        assert!(controller.pending().await.unwrap().is_empty());

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_reload_is_debounced() {
        let temp_dir = TempDir::new().unwrap();
        let controller =
            WatchController::new(WatchConfig::new(".", "0 9 * * *"), options(temp_dir.path()));
        let valid = || Ok(WatchConfig::new(".", "* * * * *"));
        let first = Instant::now();

        let outcome = controller.reload(ReloadSignal { at: first }, valid).await;
        assert!(matches!(outcome, ReloadOutcome::Restarted));

        let mut loaded = false;
        let outcome = controller
            .reload(
                ReloadSignal {
                    at: first + Duration::from_millis(400),
                },
                || {
                    loaded = true;
                    valid()
                },
            )
            .await;
        assert!(matches!(outcome, ReloadOutcome::Debounced));
        assert!(!loaded);

        let outcome = controller
            .reload(
                ReloadSignal {
                    at: first + Duration::from_millis(1500),
                },
                valid,
            )
            .await;
        assert!(matches!(outcome, ReloadOutcome::Restarted));
        assert!(controller.is_running().await);

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_reload_leaves_controller_idle() {
        let temp_dir = TempDir::new().unwrap();
        let controller =
            WatchController::new(WatchConfig::new(".", "* * * * *"), options(temp_dir.path()));
        controller.start().await.unwrap();
        let first = Instant::now();

        let outcome = controller
            .reload(ReloadSignal { at: first }, || {
                Ok(WatchConfig::new("missing", "* * * * *"))
            })
            .await;
        assert!(matches!(
            outcome,
            ReloadOutcome::Idle(WatcherError::Validation(_))
        ));
        assert!(!controller.is_running().await);

        let outcome = controller
            .reload(
                ReloadSignal {
                    at: first + Duration::from_secs(2),
                },
                || Err(WatcherError::Config("broken file".to_string())),
            )
            .await;
        assert!(matches!(outcome, ReloadOutcome::Idle(WatcherError::Config(_))));
        assert!(controller.start().await.is_err());

        let outcome = controller
            .reload(
                ReloadSignal {
                    at: first + Duration::from_secs(4),
                },
                || Ok(WatchConfig::new(".", "* * * * *")),
            )
            .await;
        assert!(matches!(outcome, ReloadOutcome::Restarted));
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_run_applies_reloads_until_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let controller =
            WatchController::new(WatchConfig::new("missing", "* * * * *"), options(temp_dir.path()));
        let (reload_tx, reload_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let driver = async {
            reload_tx.send(ReloadSignal::now()).await.unwrap();
            assert!(wait_until_watching(&controller).await);
            shutdown_tx.send(()).unwrap();
        };
        let run = controller.run(
            reload_rx,
            || Ok(WatchConfig::new(".", "* * * * *")),
            async {
                let _ = shutdown_rx.await;
            },
        );

        let (result, ()) = tokio::join!(run, driver);
        assert!(result.is_ok());
        assert!(!controller.is_running().await);
    }
}
