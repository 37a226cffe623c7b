//! Match state and authoritative tick loop

use dashmap::DashMap;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MatchSettings;
use crate::protocol::{
    DamageCause, EndReason, ExplosionEvent, MatchOver, MatchSnapshot, RobotId, RobotMatchStats,
    RobotMessage, ScriptErrorKind, TickEvents,
};
use crate::script::{BotProfile, RhaiEngine, RobotApi, ScriptEngine, ScriptError};
use crate::util::rate_limit::LogRateLimiter;
use crate::util::time::tick_duration;

use super::collision::CollisionSystem;
use super::combat::SELF_DESTRUCT_EXPLOSION_SIZE;
use super::physics::{Arena, PhysicsSystem};
use super::robot::{Robot, MAX_DAMAGE};
use super::snapshot::SnapshotBuilder;
use super::targeting::{self, Contact, ScanResult};

/// Distance of the starting columns from the left and right walls
const START_COLUMN_INSET: f32 = 150.0;

/// Distance of the first and last starting rows from the top and bottom walls
const START_ROW_INSET: f32 = 100.0;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Constructed, loop not started
    Ready,
    /// Tick loop running
    Running,
    /// Halted by `stop` before an outcome
    Stopped,
    /// Outcome decided, terminal
    Ended,
}

/// One seat in a match
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: RobotId,
    pub name: String,
    /// Opaque descriptor passed through to snapshots
    pub cosmetic: serde_json::Value,
    /// Script source
    pub code: String,
}

impl Participant {
    pub fn new(id: RobotId, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            cosmetic: serde_json::Value::Null,
            code: code.into(),
        }
    }

    /// Participant driven by a bundled bot script
    pub fn bot(profile: BotProfile) -> Self {
        Self::new(Uuid::new_v4(), profile.display_name(), profile.source())
    }

    pub fn with_cosmetic(mut self, cosmetic: serde_json::Value) -> Self {
        self.cosmetic = cosmetic;
        self
    }
}

/// Invoked exactly once when a match ends
pub type MatchOverCallback = Box<dyn FnOnce(MatchOver) + Send + 'static>;

/// Commands accepted by a running match between ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCommand {
    SelfDestruct(RobotId),
    RemoveParticipant(RobotId),
}

/// Result of one step
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Match continues, snapshot of this tick
    Snapshot(MatchSnapshot),
    /// Match is over or was stopped, nothing was simulated
    Ended,
}

/// Match errors
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("A match needs at least one participant")]
    NoParticipants,

    #[error("Duplicate participant id: {0}")]
    DuplicateParticipant(RobotId),

    #[error("Unknown robot: {0}")]
    UnknownRobot(RobotId),

    #[error("Robot is not active: {0}")]
    RobotNotActive(RobotId),

    #[error("Match has already ended")]
    MatchEnded,

    #[error("Match was stopped")]
    MatchStopped,

    #[error("Match task is no longer running")]
    ChannelClosed,

    #[error("Simulation fault: {0}")]
    Internal(String),
}

/// Handle to a match, cheap to clone
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    command_tx: mpsc::Sender<MatchCommand>,
    snapshot_tx: broadcast::Sender<MatchSnapshot>,
    stop_tx: Arc<watch::Sender<bool>>,
    active_count: Arc<AtomicUsize>,
    finished: Arc<AtomicBool>,
}

impl MatchHandle {
    /// Receive snapshots from the next tick on
    pub fn subscribe(&self) -> broadcast::Receiver<MatchSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Halt the tick loop. Safe to call any number of times.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub async fn self_destruct(&self, robot_id: RobotId) -> Result<(), MatchError> {
        self.command(MatchCommand::SelfDestruct(robot_id)).await
    }

    pub async fn remove_participant(&self, robot_id: RobotId) -> Result<(), MatchError> {
        self.command(MatchCommand::RemoveParticipant(robot_id)).await
    }

    async fn command(&self, command: MatchCommand) -> Result<(), MatchError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| MatchError::ChannelClosed)
    }

    /// Robots still active as of the last tick
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// True once the match has ended or been stopped
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Registry of all live matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_active_robots(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().active_count())
            .sum()
    }

    /// Drop handles of matches that are no longer running
    pub fn prune_finished(&self) -> usize {
        let before = self.matches.len();
        self.matches.retain(|_, handle| !handle.is_finished());
        before - self.matches.len()
    }

    pub fn stop_all(&self) {
        for entry in self.matches.iter() {
            entry.value().stop();
        }
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Starting position for the `index`-th of `count` robots: alternate walls, facing inward
fn start_position(index: usize, count: usize, arena: &Arena) -> (f32, f32, f32) {
    let rows = count.div_ceil(2).max(1);
    let row = index / 2;
    let row_gap = (arena.height - 2.0 * START_ROW_INSET) / (rows - 1).max(1) as f32;

    let y = START_ROW_INSET + row as f32 * row_gap;
    if index % 2 == 0 {
        (START_COLUMN_INSET, y, 0.0)
    } else {
        (arena.width - START_COLUMN_INSET, y, 180.0)
    }
}

/// The authoritative match
pub struct GameMatch<E: ScriptEngine = RhaiEngine> {
    id: Uuid,
    settings: MatchSettings,
    engine: E,
    phase: MatchPhase,
    tick: u64,
    initial_count: usize,

    /// Robots in participant order
    robots: Vec<Robot>,
    /// Compiled script per robot, `None` when inert
    scripts: Vec<Option<E::Handle>>,
    log_limiters: Vec<LogRateLimiter>,
    /// Owners no longer receiving messages
    disconnected: HashSet<RobotId>,

    /// Events since the last snapshot
    events: TickEvents,
    snapshot_builder: SnapshotBuilder,
    result: Option<MatchOver>,
    on_match_over: Option<MatchOverCallback>,

    command_rx: mpsc::Receiver<MatchCommand>,
    stop_rx: watch::Receiver<bool>,
    snapshot_tx: broadcast::Sender<MatchSnapshot>,
    message_tx: mpsc::Sender<RobotMessage>,
    message_rx: Option<mpsc::Receiver<RobotMessage>>,
    active_count: Arc<AtomicUsize>,
    finished: Arc<AtomicBool>,
}

impl<E: ScriptEngine> GameMatch<E> {
    /// Build a match: place robots and compile every script. Compile failures
    /// leave that robot inert and queue an `Init` error for its owner.
    pub fn new(
        id: Uuid,
        participants: Vec<Participant>,
        settings: MatchSettings,
        engine: E,
        on_match_over: Option<MatchOverCallback>,
    ) -> Result<(Self, MatchHandle), MatchError> {
        if participants.is_empty() {
            return Err(MatchError::NoParticipants);
        }
        let mut seen = HashSet::new();
        for participant in &participants {
            if !seen.insert(participant.id) {
                return Err(MatchError::DuplicateParticipant(participant.id));
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let active_count = Arc::new(AtomicUsize::new(participants.len()));
        let finished = Arc::new(AtomicBool::new(false));

        let handle = MatchHandle {
            id,
            command_tx,
            snapshot_tx: snapshot_tx.clone(),
            stop_tx: Arc::new(stop_tx),
            active_count: active_count.clone(),
            finished: finished.clone(),
        };

        let count = participants.len();
        let mut game_match = Self {
            id,
            engine,
            phase: MatchPhase::Ready,
            tick: 0,
            initial_count: count,
            robots: Vec::with_capacity(count),
            scripts: Vec::with_capacity(count),
            log_limiters: Vec::with_capacity(count),
            disconnected: HashSet::new(),
            events: TickEvents::default(),
            snapshot_builder: SnapshotBuilder::new(),
            result: None,
            on_match_over,
            command_rx,
            stop_rx,
            snapshot_tx,
            message_tx,
            message_rx: Some(message_rx),
            active_count,
            finished,
            settings,
        };

        for (index, participant) in participants.into_iter().enumerate() {
            let (x, y, heading) = start_position(index, count, &game_match.settings.arena);
            let robot = Robot::new(
                participant.id,
                participant.name,
                participant.cosmetic,
                x,
                y,
                heading,
            );

            let script = match game_match
                .engine
                .compile(&participant.code, &game_match.settings.script_budget)
            {
                Ok(script) => Some(script),
                Err(err) => {
                    warn!(
                        match_id = %id,
                        robot_id = %robot.id,
                        error = %err,
                        "Robot script failed to compile, robot is inert"
                    );
                    game_match.send_message(RobotMessage::CodeError {
                        robot_id: robot.id,
                        kind: ScriptErrorKind::Init,
                        message: err.to_string(),
                    });
                    None
                }
            };

            game_match.robots.push(robot);
            game_match.scripts.push(script);
            game_match
                .log_limiters
                .push(LogRateLimiter::new(game_match.settings.log_lines_per_sec));
        }

        info!(match_id = %id, robots = count, "Match created");
        Ok((game_match, handle))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    pub fn robots(&self) -> &[Robot] {
        &self.robots
    }

    pub fn robot(&self, id: RobotId) -> Option<&Robot> {
        self.robots.iter().find(|r| r.id == id)
    }

    /// Events recorded since the last snapshot
    pub fn pending_events(&self) -> &TickEvents {
        &self.events
    }

    /// Match-over payload once the match has ended
    pub fn result(&self) -> Option<&MatchOver> {
        self.result.as_ref()
    }

    /// Receiver for per-robot errors and logs. Only the first call gets it.
    pub fn take_robot_messages(&mut self) -> Option<mpsc::Receiver<RobotMessage>> {
        self.message_rx.take()
    }

    /// Spawn the tick loop on the current tokio runtime
    pub fn start(self) -> JoinHandle<Self>
    where
        E::Handle: 'static,
    {
        tokio::spawn(self.run())
    }

    /// Run the tick loop until the match ends or is stopped
    pub async fn run(mut self) -> Self {
        if matches!(self.phase, MatchPhase::Ended | MatchPhase::Stopped) {
            return self;
        }
        self.phase = MatchPhase::Running;
        info!(match_id = %self.id, tick_rate = self.settings.tick_rate, "Match started");

        let period = tick_duration(self.settings.tick_rate);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_step = Instant::now();
        let mut commands_open = true;
        let mut stop_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_step).as_secs_f32();
                    last_step = now;

                    if let StepOutcome::Ended = self.step(dt) {
                        break;
                    }
                }
                command = self.command_rx.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => commands_open = false,
                    }
                    if self.phase == MatchPhase::Ended {
                        break;
                    }
                }
                changed = self.stop_rx.changed(), if stop_open => {
                    if changed.is_err() {
                        stop_open = false;
                    } else if *self.stop_rx.borrow() {
                        self.stop();
                        break;
                    }
                }
            }
        }

        self
    }

    /// Halt the match without an outcome. Idempotent, no effect once ended.
    pub fn stop(&mut self) {
        if matches!(self.phase, MatchPhase::Ended | MatchPhase::Stopped) {
            return;
        }
        self.phase = MatchPhase::Stopped;
        self.finished.store(true, Ordering::Release);
        info!(match_id = %self.id, tick = self.tick, "Match stopped");
        self.log_snapshot_stats();
    }

    fn handle_command(&mut self, command: MatchCommand) {
        let result = match command {
            MatchCommand::SelfDestruct(robot_id) => self.trigger_self_destruct(robot_id),
            MatchCommand::RemoveParticipant(robot_id) => self.remove_participant(robot_id),
        };
        if let Err(err) = result {
            debug!(match_id = %self.id, ?command, error = %err, "Match command ignored");
        }
    }

    /// Run one simulation tick of `dt` seconds
    pub fn step(&mut self, dt: f32) -> StepOutcome {
        if matches!(self.phase, MatchPhase::Ended | MatchPhase::Stopped) {
            return StepOutcome::Ended;
        }
        self.tick += 1;

        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        let advanced = panic::catch_unwind(AssertUnwindSafe(|| self.advance(dt)));
        let fault = match advanced {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(fault) = fault {
            self.abort(&fault);
            return StepOutcome::Ended;
        }

        if self.check_end(None) {
            return StepOutcome::Ended;
        }

        match self
            .snapshot_builder
            .build(self.id, self.tick, &self.robots, &self.events)
        {
            Some(snapshot) => {
                // No subscribers is fine
                let _ = self.snapshot_tx.send(snapshot.clone());
                self.events.clear();
                StepOutcome::Snapshot(snapshot)
            }
            None => {
                self.abort("snapshot tick did not advance");
                StepOutcome::Ended
            }
        }
    }

    /// Scripts, then physics, then collisions
    fn advance(&mut self, dt: f32) -> Result<(), MatchError> {
        run_untrusted(|| self.run_scripts());

        let arena = self.settings.arena;
        for robot in &mut self.robots {
            PhysicsSystem::update_robot(robot, dt, &arena, self.settings.speed_scale);
        }

        CollisionSystem::resolve(&mut self.robots, &arena, self.tick, &mut self.events);

        self.validate()
    }

    /// Run every active robot's script against the start-of-tick world
    fn run_scripts(&mut self) {
        let contacts: Arc<[Contact]> = self
            .robots
            .iter()
            .filter(|r| r.is_active())
            .map(Robot::contact)
            .collect();

        for index in 0..self.robots.len() {
            if !self.robots[index].is_active() {
                continue;
            }
            let Some(script) = self.scripts[index].as_mut() else {
                continue;
            };

            let api = RobotApi::new(&self.robots[index], contacts.clone(), self.settings.scan_range);
            let engine = &self.engine;
            let budget = &self.settings.script_budget;
            let turn_api = api.clone();
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                engine.invoke(script, turn_api, budget)
            }))
            .unwrap_or_else(|payload| Err(ScriptError::Runtime(panic_message(payload.as_ref()))));
            let turn = api.finish();
            let robot_id = self.robots[index].id;

            match result {
                Ok(()) => {
                    if let Some(view) = turn.robot {
                        self.robots[index].apply_turn(view);
                    }
                    self.events.fires.extend(turn.fires);
                }
                Err(err) => {
                    debug!(
                        match_id = %self.id,
                        robot_id = %robot_id,
                        tick = self.tick,
                        error = %err,
                        "Robot turn failed"
                    );
                    self.send_message(RobotMessage::CodeError {
                        robot_id,
                        kind: ScriptErrorKind::Runtime,
                        message: err.to_string(),
                    });
                }
            }

            self.forward_logs(index, robot_id, turn.logs, turn.dropped_logs);
        }
    }

    fn forward_logs(&mut self, index: usize, robot_id: RobotId, logs: Vec<String>, dropped: usize) {
        for message in logs {
            if self.log_limiters[index].check() {
                self.send_message(RobotMessage::Log { robot_id, message });
            }
        }

        let limited = self.log_limiters[index].take_dropped();
        if dropped > 0 || limited > 0 {
            warn!(
                match_id = %self.id,
                robot_id = %robot_id,
                over_turn_cap = dropped,
                rate_limited = limited,
                "Dropped robot log lines"
            );
        }
    }

    /// Route a message to one robot's owner
    fn send_message(&self, message: RobotMessage) {
        if self.disconnected.contains(&message.robot_id()) {
            return;
        }
        match self.message_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(
                    match_id = %self.id,
                    robot_id = %message.robot_id(),
                    "Robot message channel full, dropping message"
                );
            }
            // Nobody is listening
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Catch numeric corruption before it reaches a snapshot
    fn validate(&self) -> Result<(), MatchError> {
        for robot in &self.robots {
            let finite = robot.x.is_finite() && robot.y.is_finite() && robot.direction.is_finite();
            let damage = robot.damage();
            if !finite || !(0.0..=MAX_DAMAGE).contains(&damage) {
                return Err(MatchError::Internal(format!(
                    "robot {} in invalid state (x={}, y={}, damage={})",
                    robot.id, robot.x, robot.y, damage
                )));
            }
            if robot
                .missiles
                .iter()
                .any(|m| !m.x.is_finite() || !m.y.is_finite())
            {
                return Err(MatchError::Internal(format!(
                    "missile of robot {} has a non-finite position",
                    robot.id
                )));
            }
        }
        Ok(())
    }

    /// End the match if at most one robot is left. `reason` overrides the
    /// computed reason when set.
    fn check_end(&mut self, reason: Option<EndReason>) -> bool {
        if matches!(self.phase, MatchPhase::Ended | MatchPhase::Stopped) {
            return true;
        }

        let active = self.robots.iter().filter(|r| r.is_active()).count();
        self.active_count.store(active, Ordering::Relaxed);
        if active > 1 || self.initial_count < 2 {
            return false;
        }

        let winner = self.robots.iter().find(|r| r.is_active()).map(|r| r.id);
        let reason = reason.unwrap_or(if winner.is_some() {
            EndReason::LastStanding
        } else {
            EndReason::MutualDestruction
        });
        let final_events = std::mem::take(&mut self.events);
        self.finish(reason, winner, final_events);
        true
    }

    /// Abort after an internal fault. Pending events are discarded.
    fn abort(&mut self, fault: &str) {
        error!(match_id = %self.id, tick = self.tick, fault, "Simulation fault, aborting match");
        self.events.clear();
        self.finish(EndReason::InternalError, None, TickEvents::default());
    }

    fn finish(&mut self, reason: EndReason, winner_id: Option<RobotId>, final_events: TickEvents) {
        self.phase = MatchPhase::Ended;
        self.finished.store(true, Ordering::Release);

        let winner_name = winner_id
            .and_then(|id| self.robot(id))
            .map(|r| r.name.clone())
            .unwrap_or_else(|| "None".to_string());

        let robots = self
            .robots
            .iter()
            .map(|r| RobotMatchStats {
                robot_id: r.id,
                name: r.name.clone(),
                shots_fired: r.stats.shots_fired,
                shots_hit: r.stats.shots_hit,
                damage_dealt: r.stats.damage_dealt,
                damage_taken: r.stats.damage_taken,
                destroyed_at_tick: r.stats.destroyed_at_tick,
            })
            .collect();

        let over = MatchOver {
            match_id: self.id,
            winner_id,
            winner_name,
            reason,
            tick: self.tick,
            final_events,
            robots,
        };

        info!(
            match_id = %self.id,
            tick = self.tick,
            winner = %over.winner_name,
            ?reason,
            "Match ended"
        );

        self.log_snapshot_stats();

        self.result = Some(over.clone());
        if let Some(callback) = self.on_match_over.take() {
            callback(over);
        }
    }

    fn ensure_live(&self) -> Result<(), MatchError> {
        match self.phase {
            MatchPhase::Ended => Err(MatchError::MatchEnded),
            MatchPhase::Stopped => Err(MatchError::MatchStopped),
            MatchPhase::Ready | MatchPhase::Running => Ok(()),
        }
    }

    fn log_snapshot_stats(&self) {
        let stats = self.snapshot_builder.stats();
        debug!(
            match_id = %self.id,
            snapshots = stats.total_snapshots,
            avg_missiles = stats.avg_missiles_per_snapshot,
            peak_missiles = stats.peak_missiles,
            "Snapshot stats"
        );
    }

    fn index_of(&self, robot_id: RobotId) -> Result<usize, MatchError> {
        self.robots
            .iter()
            .position(|r| r.id == robot_id)
            .ok_or(MatchError::UnknownRobot(robot_id))
    }

    /// Nearest other active robot inside the arc, as seen from `robot_id`
    pub fn perform_scan(&self, robot_id: RobotId, direction: f32, arc_width: f32) -> Option<ScanResult> {
        let scanner = self.robot(robot_id).filter(|r| r.is_active())?;
        let contacts: Vec<Contact> = self
            .robots
            .iter()
            .filter(|r| r.is_active())
            .map(Robot::contact)
            .collect();

        targeting::scan(
            scanner.id,
            scanner.x,
            scanner.y,
            &contacts,
            direction,
            arc_width,
            self.settings.scan_range,
        )
    }

    /// Destroy an active robot on request and re-check the end condition
    pub fn trigger_self_destruct(&mut self, robot_id: RobotId) -> Result<(), MatchError> {
        self.ensure_live()?;
        let index = self.index_of(robot_id)?;
        let tick = self.tick;
        let robot = &mut self.robots[index];
        if !robot.is_active() {
            return Err(MatchError::RobotNotActive(robot_id));
        }

        robot.take_damage(MAX_DAMAGE, DamageCause::SelfDestruct);
        CollisionSystem::record_destruction(robot, DamageCause::SelfDestruct, tick, &mut self.events);
        self.events.explosions.push(ExplosionEvent {
            x: robot.x,
            y: robot.y,
            size: SELF_DESTRUCT_EXPLOSION_SIZE,
        });
        info!(match_id = %self.id, robot_id = %robot_id, "Robot self-destructed");

        self.check_end(None);
        Ok(())
    }

    /// A participant left: destroy its robot, stop its messages, re-check the end
    pub fn remove_participant(&mut self, robot_id: RobotId) -> Result<(), MatchError> {
        self.ensure_live()?;
        let index = self.index_of(robot_id)?;
        let tick = self.tick;

        self.disconnected.insert(robot_id);
        self.scripts[index] = None;

        let robot = &mut self.robots[index];
        if robot.is_active() {
            robot.take_damage(MAX_DAMAGE, DamageCause::Disconnect);
            CollisionSystem::record_destruction(robot, DamageCause::Disconnect, tick, &mut self.events);
        }
        info!(match_id = %self.id, robot_id = %robot_id, "Participant removed");

        self.check_end(Some(EndReason::Disconnect));
        Ok(())
    }
}

/// Run script code off the async worker when the runtime allows it, so a
/// slow script does not hold up other matches on the same worker
fn run_untrusted<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => task::block_in_place(f),
        _ => f(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{ScriptBudget, ScriptError};
    use parking_lot::Mutex;

    /// Engine whose scripts are Rust closures
    struct FnEngine;

    type FnScript = Box<dyn FnMut(&RobotApi) -> Result<(), ScriptError> + Send>;

    impl ScriptEngine for FnEngine {
        type Handle = FnScript;

        fn compile(&self, source: &str, _budget: &ScriptBudget) -> Result<FnScript, ScriptError> {
            match source {
                "idle" => Ok(Box::new(|_| Ok(()))),
                "forward" => Ok(Box::new(|api| {
                    api.drive(0.0, 5.0);
                    Ok(())
                })),
                "throw" => Ok(Box::new(|_| Err(ScriptError::Runtime("boom".to_string())))),
                "panic" => Ok(Box::new(|_| panic!("engine defect"))),
                "fire_once" => {
                    let mut fired = false;
                    Ok(Box::new(move |api| {
                        if !fired {
                            fired = api.fire(0.0, 3.0);
                        }
                        Ok(())
                    }))
                }
                _ => Err(ScriptError::Compile(format!("unknown script {source}"))),
            }
        }

        fn invoke(
            &self,
            handle: &mut FnScript,
            api: RobotApi,
            _budget: &ScriptBudget,
        ) -> Result<(), ScriptError> {
            handle(&api)
        }
    }

    fn new_match(
        codes: &[&str],
    ) -> (GameMatch<FnEngine>, MatchHandle, Arc<Mutex<Vec<MatchOver>>>) {
        let participants = codes
            .iter()
            .enumerate()
            .map(|(i, code)| Participant::new(Uuid::new_v4(), format!("robot-{i}"), *code))
            .collect();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let (game_match, handle) = GameMatch::new(
            Uuid::new_v4(),
            participants,
            MatchSettings::default(),
            FnEngine,
            Some(Box::new(move |over| sink.lock().push(over))),
        )
        .expect("match builds");
        (game_match, handle, results)
    }

    #[test]
    fn robots_start_on_opposite_walls() {
        let (game_match, _, _) = new_match(&["idle", "idle", "idle", "idle"]);
        let robots = game_match.robots();
        assert_eq!((robots[0].x, robots[0].y, robots[0].direction), (150.0, 100.0, 0.0));
        assert_eq!((robots[1].x, robots[1].y, robots[1].direction), (750.0, 100.0, 180.0));
        assert_eq!((robots[2].x, robots[2].y), (150.0, 800.0));
        assert_eq!((robots[3].x, robots[3].y), (750.0, 800.0));
    }

    #[test]
    fn construction_rejects_bad_rosters() {
        let result = GameMatch::new(Uuid::new_v4(), Vec::new(), MatchSettings::default(), FnEngine, None);
        assert!(matches!(result, Err(MatchError::NoParticipants)));

        let id = Uuid::new_v4();
        let twins = vec![Participant::new(id, "a", "idle"), Participant::new(id, "b", "idle")];
        let result = GameMatch::new(Uuid::new_v4(), twins, MatchSettings::default(), FnEngine, None);
        assert!(matches!(result, Err(MatchError::DuplicateParticipant(dup)) if dup == id));
    }

    #[test]
    fn compile_failure_is_reported_once() {
        let (mut game_match, _, _) = new_match(&["idle", "garbage"]);
        let mut messages = game_match.take_robot_messages().expect("receiver");
        let inert = game_match.robots()[1].id;

        match messages.try_recv() {
            Ok(RobotMessage::CodeError { robot_id, kind, .. }) => {
                assert_eq!(robot_id, inert);
                assert_eq!(kind, ScriptErrorKind::Init);
            }
            other => panic!("expected init error, got {other:?}"),
        }

        for _ in 0..5 {
            game_match.step(1.0 / 30.0);
        }
        assert!(messages.try_recv().is_err());
        assert!(game_match.take_robot_messages().is_none());
    }

    #[test]
    fn snapshots_count_up_and_clear_events() {
        let (mut game_match, handle, _) = new_match(&["forward", "idle"]);
        let mut rx = handle.subscribe();

        for expected in 1..=3 {
            match game_match.step(1.0 / 30.0) {
                StepOutcome::Snapshot(snapshot) => {
                    assert_eq!(snapshot.tick, expected);
                    assert_eq!(snapshot.robots.len(), 2);
                }
                StepOutcome::Ended => panic!("match ended early"),
            }
            assert!(game_match.pending_events().is_empty());
        }

        assert_eq!(rx.try_recv().map(|s| s.tick).ok(), Some(1));
        assert_eq!(game_match.robots()[0].x, 150.0 + 3.0 * 10.0);
    }

    #[test]
    fn failing_turns_report_runtime_errors() {
        let (mut game_match, _, _) = new_match(&["throw", "idle"]);
        let mut messages = game_match.take_robot_messages().expect("receiver");
        game_match.step(1.0 / 30.0);
        game_match.step(1.0 / 30.0);

        let mut runtime_errors = 0;
        while let Ok(message) = messages.try_recv() {
            if let RobotMessage::CodeError { kind: ScriptErrorKind::Runtime, message, .. } = message {
                assert!(message.contains("boom"));
                runtime_errors += 1;
            }
        }
        assert_eq!(runtime_errors, 2);
        assert_eq!(game_match.phase(), MatchPhase::Ready);
    }

    #[test]
    fn panicking_script_only_fails_its_own_turn() {
        let (mut game_match, handle, results) = new_match(&["forward", "panic"]);
        let mut messages = game_match.take_robot_messages().expect("receiver");
        let broken = game_match.robots()[1].id;

        for tick in 1..=2 {
            match game_match.step(1.0 / 30.0) {
                StepOutcome::Snapshot(snapshot) => assert_eq!(snapshot.tick, tick),
                StepOutcome::Ended => panic!("match ended on tick {tick}"),
            }
        }

        assert_eq!(game_match.robots()[0].x, 150.0 + 2.0 * 10.0);
        assert!(game_match.robots()[1].is_active());
        for _ in 0..2 {
            match messages.try_recv() {
                Ok(RobotMessage::CodeError { robot_id, kind, message }) => {
                    assert_eq!(robot_id, broken);
                    assert_eq!(kind, ScriptErrorKind::Runtime);
                    assert!(message.contains("engine defect"));
                }
                other => panic!("expected runtime error, got {other:?}"),
            }
        }
        assert!(results.lock().is_empty());
        assert!(!handle.is_finished());
    }

    #[test]
    fn point_blank_missile_deals_power_damage() {
        let (mut game_match, _, _) = new_match(&["fire_once", "idle"]);
        game_match.robots[1].x = game_match.robots[0].x + 50.0;
        game_match.robots[1].y = game_match.robots[0].y;
        let target = game_match.robots[1].id;

        let StepOutcome::Snapshot(snapshot) = game_match.step(1.0 / 30.0) else {
            panic!("match ended early");
        };

        assert_eq!(snapshot.events.fires.len(), 1);
        assert_eq!(snapshot.events.hits.len(), 1);
        assert_eq!(snapshot.events.hits[0].target_id, target);
        assert!(snapshot.missiles.is_empty());
        assert_eq!(game_match.robots[1].damage(), 30.0);
        assert_eq!(game_match.robots[0].stats.damage_dealt, 30.0);
    }

    #[test]
    fn throwing_robot_loses_to_collisions_alone() {
        let (mut game_match, _, results) = new_match(&["forward", "throw"]);

        let mut ended = false;
        for _ in 0..1000 {
            if let StepOutcome::Ended = game_match.step(1.0 / 30.0) {
                ended = true;
                break;
            }
        }
        assert!(ended);

        let thrower = &game_match.robots()[1];
        assert_eq!(thrower.stats.shots_fired, 0);
        assert_eq!(thrower.damage(), 100.0);
        assert_eq!(thrower.last_damage_cause(), Some(DamageCause::Collision));

        // Both hulls take the same bump damage every contact tick
        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].reason, EndReason::MutualDestruction);
        assert_eq!(results[0].winner_id, None);
        assert_eq!(results[0].winner_name, "None");
        assert_eq!(results[0].final_events.destructions.len(), 2);
    }

    #[test]
    fn self_destruct_ends_two_robot_match() {
        let (mut game_match, _, results) = new_match(&["idle", "idle"]);
        game_match.step(1.0 / 30.0);
        let (victim, survivor) = (game_match.robots()[0].clone(), game_match.robots()[1].id);

        game_match.trigger_self_destruct(victim.id).expect("self destruct");

        assert_eq!(game_match.phase(), MatchPhase::Ended);
        assert_eq!(game_match.robot(victim.id).map(|r| r.damage()), Some(100.0));

        let results = results.lock();
        assert_eq!(results.len(), 1);
        let over = &results[0];
        assert_eq!(over.winner_id, Some(survivor));
        assert_eq!(over.winner_name, "robot-1");
        assert_eq!(over.reason, EndReason::LastStanding);
        assert_eq!(over.final_events.destructions.len(), 1);
        assert_eq!(over.final_events.destructions[0].x, victim.x);
        assert_eq!(over.final_events.destructions[0].cause, DamageCause::SelfDestruct);
        assert_eq!(over.final_events.explosions[0].size, 5.0);
    }

    #[test]
    fn self_destruct_in_larger_match_continues() {
        let (mut game_match, _, results) = new_match(&["idle", "idle", "idle"]);
        let victim = game_match.robots()[2].id;
        game_match.trigger_self_destruct(victim).expect("self destruct");
        assert!(matches!(
            game_match.trigger_self_destruct(victim),
            Err(MatchError::RobotNotActive(_))
        ));

        match game_match.step(1.0 / 30.0) {
            StepOutcome::Snapshot(snapshot) => {
                assert_eq!(snapshot.events.destructions.len(), 1);
                assert!(!snapshot.robots[2].alive);
            }
            StepOutcome::Ended => panic!("two robots remain"),
        }
        assert!(results.lock().is_empty());
    }

    #[test]
    fn removal_ends_with_disconnect_and_silences_owner() {
        let (mut game_match, _, results) = new_match(&["throw", "idle"]);
        let mut messages = game_match.take_robot_messages().expect("receiver");
        let leaver = game_match.robots()[0].id;

        game_match.remove_participant(leaver).expect("removal");

        let results = results.lock();
        assert_eq!(results[0].reason, EndReason::Disconnect);
        assert_eq!(results[0].winner_id, Some(game_match.robots()[1].id));
        assert_eq!(
            results[0].final_events.destructions[0].cause,
            DamageCause::Disconnect
        );
        assert!(messages.try_recv().is_err());
        assert!(matches!(game_match.step(1.0 / 30.0), StepOutcome::Ended));
        assert!(matches!(
            game_match.remove_participant(leaver),
            Err(MatchError::MatchEnded)
        ));
    }

    #[test]
    fn single_robot_match_never_ends_by_itself() {
        let (mut game_match, _, results) = new_match(&["idle"]);
        for _ in 0..10 {
            assert!(matches!(game_match.step(1.0 / 30.0), StepOutcome::Snapshot(_)));
        }
        assert!(results.lock().is_empty());
    }

    #[test]
    fn perform_scan_sees_opponent() {
        let (game_match, _, _) = new_match(&["idle", "idle"]);
        let (a, b) = (game_match.robots()[0].id, game_match.robots()[1].id);

        let result = game_match.perform_scan(a, 0.0, 10.0).expect("opponent ahead");
        assert_eq!(result.target_id, b);
        assert!((result.distance - 600.0).abs() < 1e-3);
        assert!(game_match.perform_scan(a, 180.0, 10.0).is_none());
        assert!(game_match.perform_scan(Uuid::new_v4(), 0.0, 10.0).is_none());
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut game_match, _, results) = new_match(&["idle", "idle"]);
        game_match.stop();
        game_match.stop();
        assert_eq!(game_match.phase(), MatchPhase::Stopped);
        assert!(results.lock().is_empty());
    }

    #[test]
    fn stopped_match_no_longer_simulates() {
        let (mut game_match, handle, results) = new_match(&["forward", "idle"]);
        let mut rx = handle.subscribe();
        game_match.step(1.0 / 30.0);
        let _ = rx.try_recv();
        game_match.stop();

        for _ in 0..3 {
            assert!(matches!(game_match.step(1.0 / 30.0), StepOutcome::Ended));
        }
        assert_eq!(game_match.tick(), 1);
        assert_eq!(game_match.robots()[0].x, 160.0);
        assert!(rx.try_recv().is_err());

        let victim = game_match.robots()[1].id;
        assert!(matches!(
            game_match.trigger_self_destruct(victim),
            Err(MatchError::MatchStopped)
        ));
        assert!(matches!(
            game_match.remove_participant(victim),
            Err(MatchError::MatchStopped)
        ));
        assert_eq!(game_match.phase(), MatchPhase::Stopped);
        assert!(game_match.robots()[1].is_active());
        assert!(results.lock().is_empty());
    }

    #[tokio::test]
    async fn run_returns_at_once_when_stopped() {
        let (mut game_match, _, _) = new_match(&["forward", "idle"]);
        game_match.stop();

        let game_match = game_match.run().await;
        assert_eq!(game_match.phase(), MatchPhase::Stopped);
        assert_eq!(game_match.tick(), 0);
    }

    #[test]
    fn registry_tracks_handles() {
        let registry = MatchRegistry::new();
        let (mut game_match, handle, _) = new_match(&["idle", "idle"]);
        let id = handle.id;
        registry.insert(handle);

        assert_eq!(registry.active_matches(), 1);
        assert_eq!(registry.total_active_robots(), 2);
        assert!(registry.get(&id).is_some());

        game_match.stop();
        assert_eq!(registry.prune_finished(), 1);
        assert!(registry.remove(&id).is_none());
    }
}
