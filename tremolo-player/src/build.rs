//! Service build lifecycle
//!
//! Assembling a usable service is staged: Init, OpenCommunicator,
//! SyncCommunicator (concurrent with SendCommands), CreatePlayer,
//! CompleteService. Each stage reports through its own status token; a
//! stage failure records the error, waits a fixed delay and restarts the
//! whole sequence from OpenCommunicator, forever, until the overall token
//! is ended from outside. The communicator opener sits behind a seam so
//! transport failure can be simulated.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tremolo_common::model::AudioService;
use uuid::Uuid;

use crate::config::{LaunchConfig, RunMode};
use crate::error::{Error, Result};
use crate::player::{run_player_bridge, NoopPlayer, ServicePlayer};
use crate::status::{Outcome, StatusToken};
use crate::sync::topics::Command;
use crate::sync::{Communicator, SyncClient, SyncServer};

/// Pause between failed build attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Seam for the OpenCommunicator stage. `None` means standalone: the
/// model runs without any transport.
pub trait CommunicatorOpener: Send + Sync + 'static {
    fn open(
        &self,
        service: Arc<RwLock<AudioService>>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Communicator>>> + Send + '_>>;
}

/// The production opener: maps the run mode onto a communicator role.
pub struct ModeOpener {
    mode: RunMode,
}

impl ModeOpener {
    pub fn new(mode: RunMode) -> Self {
        Self { mode }
    }
}

impl CommunicatorOpener for ModeOpener {
    fn open(
        &self,
        service: Arc<RwLock<AudioService>>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Communicator>>> + Send + '_>> {
        let mode = self.mode.clone();
        Box::pin(async move {
            match mode {
                RunMode::Standalone => Ok(None),
                RunMode::Server { port } => Ok(Some(Communicator::Server(
                    SyncServer::bind(service, port).await?,
                ))),
                RunMode::Client { address } => Ok(Some(Communicator::Client(
                    SyncClient::connect(service, &address).await?,
                ))),
            }
        })
    }
}

/// Per-attempt stage tokens. A fresh set is issued on every retry so a
/// stage that succeeded in a failed attempt does not read as done.
pub struct StageTokens {
    pub open: StatusToken,
    pub sync: StatusToken,
    pub commands: StatusToken,
    pub player: StatusToken,
    pub complete: StatusToken,
}

impl StageTokens {
    fn new() -> Self {
        Self {
            open: StatusToken::new(),
            sync: StatusToken::new(),
            commands: StatusToken::new(),
            player: StatusToken::new(),
            complete: StatusToken::new(),
        }
    }

    fn cancel_all(&self) {
        self.open.end(Outcome::Canceled);
        self.sync.end(Outcome::Canceled);
        self.commands.end(Outcome::Canceled);
        self.player.end(Outcome::Canceled);
        self.complete.end(Outcome::Canceled);
    }
}

/// Progress of one build run. `overall` spans all attempts and doubles as
/// the external cancellation handle; the stage tokens describe the
/// attempt currently in flight.
pub struct BuildStatus {
    pub overall: StatusToken<BuildResult>,
    stages: Mutex<Arc<StageTokens>>,
}

impl BuildStatus {
    fn new() -> Self {
        Self {
            overall: StatusToken::new(),
            stages: Mutex::new(Arc::new(StageTokens::new())),
        }
    }

    /// Stage tokens of the attempt currently in flight.
    pub fn stages(&self) -> Arc<StageTokens> {
        self.stages.lock().expect("stage tokens poisoned").clone()
    }

    fn begin_attempt(&self) -> Arc<StageTokens> {
        let fresh = Arc::new(StageTokens::new());
        *self.stages.lock().expect("stage tokens poisoned") = fresh.clone();
        fresh
    }
}

/// What a successful build hands back.
pub struct BuildResult {
    pub service: Arc<RwLock<AudioService>>,
    /// `None` in standalone mode.
    pub communicator: Option<Arc<Communicator>>,
    pub player: Arc<dyn ServicePlayer>,
    /// Bridge task feeding model events into the player; abort before
    /// rebuilding on the same service.
    pub player_bridge: JoinHandle<()>,
    pub data_file: Option<PathBuf>,
}

/// Drives the staged build to a terminal outcome.
pub struct ServiceBuilder {
    service: Arc<RwLock<AudioService>>,
    config: LaunchConfig,
    opener: Arc<dyn CommunicatorOpener>,
    player: Arc<dyn ServicePlayer>,
    pending: Mutex<Vec<Command>>,
    status: Arc<BuildStatus>,
}

impl ServiceBuilder {
    pub fn new(config: LaunchConfig) -> Self {
        Self::with_service(Arc::new(RwLock::new(AudioService::new())), config)
    }

    /// Build onto an existing service, used when reconnecting after a
    /// dropped transport without losing local state.
    pub fn with_service(service: Arc<RwLock<AudioService>>, config: LaunchConfig) -> Self {
        let opener = Arc::new(ModeOpener::new(config.mode.clone()));
        Self {
            service,
            config,
            opener,
            player: Arc::new(NoopPlayer),
            pending: Mutex::new(Vec::new()),
            status: Arc::new(BuildStatus::new()),
        }
    }

    pub fn with_opener(mut self, opener: Arc<dyn CommunicatorOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_player(mut self, player: Arc<dyn ServicePlayer>) -> Self {
        self.player = player;
        self
    }

    pub fn service(&self) -> Arc<RwLock<AudioService>> {
        self.service.clone()
    }

    pub fn status(&self) -> Arc<BuildStatus> {
        self.status.clone()
    }

    /// Queue a transport command for replay once the communicator is up.
    pub fn queue_command(&self, command: Command) {
        self.pending
            .lock()
            .expect("pending commands poisoned")
            .push(command);
    }

    /// End the build from outside. Safe to call at any stage; an attempt
    /// in flight aborts instead of retrying.
    pub fn cancel(&self) {
        self.status.overall.end(Outcome::Canceled);
        self.status.stages().cancel_all();
    }

    /// End the build because the user diverted to reconfiguration.
    pub fn divert_to_settings(&self) {
        self.status.overall.end(Outcome::Settings);
        self.status.stages().cancel_all();
    }

    /// Run attempts until one succeeds or the overall token ends.
    pub async fn run(&self) -> Outcome {
        self.apply_launch_config().await;
        loop {
            if let Some(outcome) = self.status.overall.outcome() {
                return outcome;
            }
            match self.attempt().await {
                Ok(result) => {
                    let bridge = result.player_bridge.abort_handle();
                    let communicator = result.communicator.clone();
                    if self.status.overall.end_with(Outcome::Successful, result) {
                        info!("service build finished");
                        return Outcome::Successful;
                    }
                    // Ended externally while the attempt was completing;
                    // the winner's outcome stands, tear our attempt down.
                    bridge.abort();
                    if let Some(communicator) = &communicator {
                        communicator.close().await;
                    }
                    return self.status.overall.outcome().unwrap_or(Outcome::Canceled);
                }
                Err(e) => {
                    warn!("build attempt failed: {}; retrying in {:?}", e, RETRY_DELAY);
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                        outcome = self.status.overall.wait() => return outcome,
                    }
                }
            }
        }
    }

    /// Init stage: push launch overrides into the model once, before any
    /// transport exists, so they replicate like every other change.
    async fn apply_launch_config(&self) {
        let config = self.config.clone();
        let mut service = self.service.write().await;
        if let Some(volume) = config.volume {
            service.set_volume(volume);
        }
        if let Some(state) = config.play_state {
            service.set_play_state(state);
        }
        let _ = service.update_playlist(Uuid::nil(), move |playlist, bus| {
            if !config.media_sources.is_empty() {
                playlist.set_file_media_sources(Some(config.media_sources), bus);
            }
            if let Some(key) = config.search_key {
                playlist.set_search_key(key, bus);
            }
            if config.shuffle {
                playlist.set_is_search_shuffle(true, bus);
            }
        });
    }

    async fn attempt(&self) -> Result<BuildResult> {
        let stages = self.status.begin_attempt();

        let opened = match self
            .status
            .overall
            .race(self.opener.open(self.service.clone()))
            .await
        {
            Ok(opened) => opened,
            Err(outcome) => return Err(Error::Sync(format!("build ended during open: {outcome:?}"))),
        };
        let communicator = match opened {
            Ok(communicator) => {
                stages.open.end(Outcome::Successful);
                communicator.map(Arc::new)
            }
            Err(e) => return Err(fail_stage(&stages.open, "open communicator", e)),
        };

        if let Some(communicator) = &communicator {
            let sync_stage = async {
                match communicator.sync(&stages.sync).await {
                    Ok(()) => {
                        stages.sync.end(Outcome::Successful);
                        Ok(())
                    }
                    Err(e) => Err(fail_stage(&stages.sync, "sync communicator", e)),
                }
            };
            let send_stage = self.replay_pending(communicator, &stages.commands);
            let (synced, ()) = tokio::join!(sync_stage, send_stage);
            if let Err(e) = synced {
                communicator.close().await;
                return Err(e);
            }
        } else {
            stages.sync.end(Outcome::Successful);
            stages.commands.end(Outcome::Successful);
        }

        let player = self.player.clone();
        let player_bridge = tokio::spawn(run_player_bridge(self.service.clone(), player.clone()));
        stages.player.end(Outcome::Successful);

        if let Some(path) = &self.config.data_file {
            debug!("service data file at {}", path.display());
        }
        stages.complete.end(Outcome::Successful);

        Ok(BuildResult {
            service: self.service.clone(),
            communicator,
            player,
            player_bridge,
            data_file: self.config.data_file.clone(),
        })
    }

    /// SendCommands stage: replay commands queued while disconnected.
    /// Best effort only; failures are logged, never fatal.
    async fn replay_pending(&self, communicator: &Communicator, token: &StatusToken) {
        let pending: Vec<Command> = self
            .pending
            .lock()
            .expect("pending commands poisoned")
            .drain(..)
            .collect();
        for command in pending {
            if let Err(e) = communicator.send_command(command).await {
                warn!("command replay failed: {}", e);
                token.set_error(e);
            }
        }
        token.end(Outcome::Successful);
    }
}

fn fail_stage(token: &StatusToken, stage: &str, error: Error) -> Error {
    error!("{} failed: {}", stage, error);
    let summary = Error::Sync(format!("{stage}: {error}"));
    token.set_error(error);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Opener that fails a fixed number of times, then opens standalone.
    struct FlakyOpener {
        failures: usize,
        attempts: Arc<AtomicUsize>,
    }

    impl CommunicatorOpener for FlakyOpener {
        fn open(
            &self,
            _service: Arc<RwLock<AudioService>>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Communicator>>> + Send + '_>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let fail = attempt < self.failures;
            Box::pin(async move {
                if fail {
                    Err(Error::Transport("simulated connect failure".into()))
                } else {
                    Ok(None)
                }
            })
        }
    }

    fn standalone_config() -> LaunchConfig {
        LaunchConfig {
            mode: RunMode::Standalone,
            volume: None,
            play_state: None,
            shuffle: false,
            search_key: None,
            media_sources: Vec::new(),
            data_file: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success_is_three_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let builder = ServiceBuilder::new(standalone_config()).with_opener(Arc::new(FlakyOpener {
            failures: 2,
            attempts: attempts.clone(),
        }));

        let started = tokio::time::Instant::now();
        let outcome = builder.run().await;

        assert_eq!(outcome, Outcome::Successful);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two fixed delays between the three attempts.
        assert!(started.elapsed() >= RETRY_DELAY * 2);
        assert!(builder.status().overall.take_result().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_the_retry_loop() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let builder = Arc::new(ServiceBuilder::new(standalone_config()).with_opener(Arc::new(
            FlakyOpener {
                failures: usize::MAX,
                attempts: attempts.clone(),
            },
        )));

        let runner = {
            let builder = builder.clone();
            tokio::spawn(async move { builder.run().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        builder.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run should end after cancel")
            .unwrap();
        assert_eq!(outcome, Outcome::Canceled);
    }

    #[tokio::test]
    async fn test_standalone_build_succeeds_without_transport() {
        let builder = ServiceBuilder::new(LaunchConfig {
            volume: Some(0.4),
            search_key: Some("night".into()),
            shuffle: true,
            ..standalone_config()
        });
        let outcome = builder.run().await;
        assert_eq!(outcome, Outcome::Successful);

        let result = builder.status().overall.take_result().unwrap();
        assert!(result.communicator.is_none());
        let service = result.service.read().await;
        assert_eq!(service.volume(), 0.4);
        assert_eq!(service.source_playlist().search_key(), "night");
        assert!(service.source_playlist().is_search_shuffle());
        result.player_bridge.abort();
    }

    #[tokio::test]
    async fn test_stage_tokens_read_successful_after_build() {
        let builder = ServiceBuilder::new(standalone_config());
        builder.run().await;
        let stages = builder.status().stages();
        assert_eq!(stages.open.outcome(), Some(Outcome::Successful));
        assert_eq!(stages.sync.outcome(), Some(Outcome::Successful));
        assert_eq!(stages.commands.outcome(), Some(Outcome::Successful));
        assert_eq!(stages.player.outcome(), Some(Outcome::Successful));
        assert_eq!(stages.complete.outcome(), Some(Outcome::Successful));
    }
}
