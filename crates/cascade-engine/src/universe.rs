//! The root transaction.
//!
//! A universe owns the authoritative state and a bounded queue of actions.
//! Imperative commits go to a separate unbounded queue that is served
//! first. One scheduler thread takes actions off the queues and settles
//! each one:
//!
//! ```text
//! action ─▶ immediate tiers ─▶ deferring tier ─▶ … ─▶ orphans cleared ─▶ checked
//!             (one, scheduled, forward)    (inner … backward)
//! ```
//!
//! The settled state is pushed onto the history, published on the status
//! channel and committed to the imperative bridges.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cascade_core::{
    ActionId, Cell, ClassId, Construction, Containing, Direction, EngineConfig, EngineError,
    EngineResult, Leaf, ObjectId, Priority, PropertyId, Queued, Reader, Registry, Slot, State,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::context::{Shared, Snapshots};
use crate::imperative::{Delta, DeltaHandler, ImperativeSet, ImperativeTransaction, Scheduler};
use crate::json::StateJson;
use crate::objects::ObjectTable;
use crate::stats::StatsSnapshot;
use crate::status::{Mood, Status, StatusProvider};
use crate::transaction::{
    dequeue_where, enqueue, next_transaction_id, Action, ActionBody, ActionFn, Derivation,
    DerivationTransaction, MutableTransaction, Transaction, TransactionKind,
};

/// Statistics are republished at least this often while busy.
const STATUS_REFRESH: Duration = Duration::from_millis(300);

/// State shared between the handle, the scheduler thread and imperatives.
pub(crate) struct UniverseInner {
    pub shared: Shared,
    pub status: StatusProvider,
    sender: Sender<Action>,
    receiver: Receiver<Action>,
    /// Unbounded queue for actions the engine submits itself.
    internal_sender: Sender<Action>,
    internal_receiver: Receiver<Action>,
    next_action: AtomicU64,
    stopping: AtomicBool,
    imperatives: Mutex<ImperativeSet>,
    last_refresh: Mutex<Instant>,
}

/// Handle to a running universe.
pub struct UniverseTransaction {
    inner: Arc<UniverseInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UniverseTransaction {
    /// Start a universe with an empty initialization.
    pub fn start(registry: Registry, config: EngineConfig) -> EngineResult<Self> {
        Self::launch(registry, config, None)
    }

    /// Start a universe whose first action runs `init`.
    pub fn start_with<F>(registry: Registry, config: EngineConfig, init: F) -> EngineResult<Self>
    where
        F: Fn(&mut dyn Leaf) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self::launch(registry, config, Some(Arc::new(init)))
    }

    fn launch(registry: Registry, config: EngineConfig, init: Option<ActionFn>) -> EngineResult<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(config.max_in_queue.max(1));
        let (internal_sender, internal_receiver) = crossbeam_channel::unbounded();
        info!(
            max_in_queue = config.max_in_queue,
            parallelism = config.parallelism,
            sequential = config.run_sequential,
            "universe_starting"
        );
        let inner = Arc::new(UniverseInner {
            shared: Shared::new(Arc::new(registry), config),
            status: StatusProvider::new(),
            sender,
            receiver,
            internal_sender,
            internal_receiver,
            next_action: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            imperatives: Mutex::new(ImperativeSet::default()),
            last_refresh: Mutex::new(Instant::now()),
        });
        inner.enqueue("$init", ActionBody::Init(init))?;
        let handle = std::thread::Builder::new()
            .name("cascade-universe".to_string())
            .spawn({
                let inner = inner.clone();
                move || run_loop(inner)
            })
            .map_err(|e| EngineError::failed(format!("cannot spawn universe thread: {e}")))?;
        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue an action. Blocks while the queue is full.
    ///
    /// Returns [`EngineError::Killed`] without queueing once the universe is
    /// killed or stopping.
    pub fn put<F>(&self, name: &str, body: F) -> EngineResult<ActionId>
    where
        F: Fn(&mut dyn Leaf) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.inner.enqueue(name, ActionBody::Run(Arc::new(body)))
    }

    /// Queue an action and wait until it settled and the universe is idle.
    pub fn put_and_wait<F>(&self, name: &str, body: F) -> EngineResult<State>
    where
        F: Fn(&mut dyn Leaf) -> EngineResult<()> + Send + Sync + 'static,
    {
        let id = self.put(name, body)?;
        let status = self
            .inner
            .status
            .wait_for(|s| s.has_completed(id) && s.is_idle());
        self.settled(status)
    }

    /// Allocate a new object of `class`; it becomes part of the graph once
    /// an action puts it in a containment property.
    pub fn new_object(&self, class: ClassId, name: &str) -> ObjectId {
        self.inner.shared.objects.allocate(class, Some(name))
    }

    /// Last published state.
    pub fn state(&self) -> State {
        self.inner.status.current().state
    }

    pub fn status(&self) -> Status {
        self.inner.status.current()
    }

    pub fn status_provider(&self) -> &StatusProvider {
        &self.inner.status
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.shared.stats.snapshot()
    }

    pub fn wait_for_idle(&self) -> Status {
        self.inner.status.wait_for_idle()
    }

    /// Step back to the state before the last action.
    pub fn backward(&self) -> EngineResult<ActionId> {
        self.inner.enqueue("$backward", ActionBody::Backward)
    }

    /// Redo a state undone by [`UniverseTransaction::backward`].
    pub fn forward(&self) -> EngineResult<ActionId> {
        self.inner.enqueue("$forward", ActionBody::Forward)
    }

    /// Push the current state to the imperatives without changing it.
    pub fn commit(&self) -> EngineResult<ActionId> {
        self.inner.enqueue("$commit", ActionBody::Commit)
    }

    /// Finish the queued actions, then stop.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.inner.enqueue("$stop", ActionBody::Stop) {
            debug!(error = %e, "stop_not_queued");
        }
    }

    /// Stop accepting work and drop what is queued.
    pub fn kill(&self) {
        warn!("universe_killed");
        self.inner.shared.kill();
        if let Err(e) = self.inner.enqueue("$stop", ActionBody::Stop) {
            debug!(error = %e, "stop_not_queued");
        }
    }

    pub fn is_killed(&self) -> bool {
        self.inner.shared.is_killed()
    }

    /// Wait for the scheduler to finish.
    ///
    /// Returns the final state, or the first recorded error with
    /// consistency errors reported first.
    pub fn wait_for_end(&self) -> EngineResult<State> {
        let status = self.inner.status.wait_for_stopped();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                return Err(EngineError::failed("universe thread panicked"));
            }
        }
        match self.inner.shared.errors().into_iter().next() {
            Some(error) => Err(error),
            None => Ok(status.state),
        }
    }

    /// Recorded errors in reporting order.
    pub fn errors(&self) -> Vec<EngineError> {
        self.inner.shared.errors()
    }

    /// What `property` of `object` would be if its derivers ran now.
    pub fn derive(&self, object: ObjectId, property: PropertyId) -> EngineResult<Derivation> {
        let state = self.state();
        DerivationTransaction::new(&self.inner.shared, &state, object).derive(object, property)
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.shared.registry
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.inner.shared.objects
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.shared.config
    }

    /// JSON rendering of `root` in the last published state.
    pub fn to_json(&self, root: ObjectId) -> serde_json::Value {
        let state = self.state();
        StateJson::new(self.registry(), self.objects(), &state).render(root)
    }

    /// Register an imperative bridge.
    ///
    /// `handler` runs on `scheduler` with every delta. With `keep_affinity`
    /// the scheduler thread keeps the imperative as
    /// [`ImperativeTransaction::current`] between commits.
    pub fn add_imperative<H>(
        &self,
        name: &str,
        handler: H,
        scheduler: Arc<dyn Scheduler>,
        keep_affinity: bool,
    ) -> Arc<ImperativeTransaction>
    where
        H: Fn(&ImperativeTransaction, &Delta<'_>) + Send + Sync + 'static,
    {
        let handler: DeltaHandler = Arc::new(handler);
        let imperative = {
            let mut set = self.inner.imperatives.lock();
            let imperative = Arc::new(ImperativeTransaction::new(
                set.next_index(),
                name,
                self.inner.shared.registry.clone(),
                Arc::downgrade(&self.inner),
                scheduler,
                handler,
                keep_affinity,
            ));
            set.add(imperative.clone());
            imperative
        };
        debug!(imperative = name, index = imperative.index(), "imperative_added");
        if let Err(e) = self.commit() {
            debug!(error = %e, "initial_commit_not_queued");
        }
        imperative
    }

    /// Declare that `first` sees every commit before `second`.
    ///
    /// A declaration closing a cycle is rejected and kills the universe.
    pub fn order_imperatives(&self, first: &ImperativeTransaction, second: &ImperativeTransaction) -> EngineResult<()> {
        let result = self.inner.imperatives.lock().order(first.index(), second.index());
        if let Err(error) = &result {
            self.inner.shared.fail(error.clone());
            if let Err(e) = self.inner.enqueue("$stop", ActionBody::Stop) {
                debug!(error = %e, "stop_not_queued");
            }
        }
        result
    }

    fn settled(&self, status: Status) -> EngineResult<State> {
        if self.inner.shared.is_killed() {
            return Err(self
                .inner
                .shared
                .errors()
                .into_iter()
                .next()
                .unwrap_or(EngineError::Killed));
        }
        Ok(status.state)
    }
}

impl Transaction for UniverseTransaction {
    fn kind(&self) -> TransactionKind {
        TransactionKind::Universe
    }

    fn target(&self) -> ObjectId {
        ObjectId::UNIVERSE
    }
}

impl Drop for UniverseTransaction {
    fn drop(&mut self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if !self.inner.status.current().is_stopped() {
            self.inner.shared.kill();
            // The scheduler drains the queue once killed; a full queue
            // would otherwise keep this send blocked.
            if self.inner.enqueue("$stop", ActionBody::Stop).is_err() {
                return;
            }
        }
        let _ = handle.join();
    }
}

impl UniverseInner {
    /// Put an action on the queue. Blocks while the queue is full.
    pub(crate) fn enqueue(&self, name: &str, body: ActionBody) -> EngineResult<ActionId> {
        self.submit(&self.sender, name, body)
    }

    /// Put an engine-originated action on the internal queue. Never blocks,
    /// so it is safe on the universe thread itself.
    pub(crate) fn enqueue_internal(&self, name: &str, body: ActionBody) -> EngineResult<ActionId> {
        self.submit(&self.internal_sender, name, body)
    }

    fn submit(&self, channel: &Sender<Action>, name: &str, body: ActionBody) -> EngineResult<ActionId> {
        let is_stop = matches!(body, ActionBody::Stop);
        if !is_stop && (self.shared.is_killed() || self.stopping.load(Ordering::SeqCst)) {
            return Err(EngineError::Killed);
        }
        let id = ActionId(self.next_action.fetch_add(1, Ordering::Relaxed));
        self.status.update(|s| {
            s.queued += 1;
            if s.mood == Mood::Idle {
                s.mood = Mood::Busy;
            }
        });
        if channel.send(Action::new(id, name, body)).is_err() {
            self.status.update(|s| s.queued = s.queued.saturating_sub(1));
            return Err(EngineError::Killed);
        }
        Ok(id)
    }

    /// Next action to run; internal actions go first.
    fn next_action(&self) -> Option<Action> {
        if let Ok(action) = self.internal_receiver.try_recv() {
            return Some(action);
        }
        crossbeam_channel::select! {
            recv(self.internal_receiver) -> action => action.ok(),
            recv(self.receiver) -> action => action.ok(),
        }
    }

    /// An imperative finished its commit.
    pub(crate) fn deactivate(&self, name: &str) {
        self.status.update(|s| {
            s.active.remove(name);
        });
    }

    fn commit_imperatives(&self, state: &State, time_traveling: bool) {
        let chain = self.imperatives.lock().ordered();
        if chain.is_empty() {
            return;
        }
        self.status
            .update(|s| s.active.extend(chain.iter().map(|i| i.name().clone())));
        ImperativeTransaction::commit_chain(Arc::new(chain), 0, state.clone(), time_traveling);
    }

    fn refresh_status(&self) {
        let mut last = self.last_refresh.lock();
        if last.elapsed() < STATUS_REFRESH {
            return;
        }
        *last = Instant::now();
        let stats = self.shared.stats.snapshot();
        self.status.update(|s| s.stats = stats);
    }

    /// Run one action to a fixed point. On failure the state is unchanged.
    fn run_action(&self, state: &State, action: &Action, timeline: &Timeline) -> State {
        let shared = &self.shared;
        let config = &shared.config;
        shared.stats.begin_action();
        if config.trace_actions || config.trace_universe {
            debug!(action = %action.name, id = %action.id, "universe_action_start");
        }
        let started = Instant::now();

        let mut snapshots = Snapshots::new(state, timeline.recent());
        let mut next = state.clone();
        next_transaction_id(&mut next);
        shared.actions.insert(action.id, action.clone());
        enqueue(&mut next, Queued::action(ObjectId::UNIVERSE, action.id), Priority::Scheduled);
        let next = self.settle(next, &mut snapshots);
        shared.actions.remove(&action.id);

        let is_init = matches!(action.body, ActionBody::Init(_));
        if !shared.is_killed() && (!is_init || config.dev_mode) {
            for error in self.check_consistency(state, &next) {
                shared.fail(error);
            }
        }
        if shared.is_killed() {
            warn!(action = %action.name, "universe_action_aborted");
            return state.clone();
        }
        if config.trace_actions || config.trace_universe {
            debug!(
                action = %action.name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                objects = next.object_count(),
                "universe_action_done"
            );
        }
        next
    }

    /// Drain every tier, then clear orphans, until nothing is left to do.
    fn settle(&self, mut state: State, snapshots: &mut Snapshots) -> State {
        let shared = &self.shared;
        let mut cleared = BTreeSet::new();
        loop {
            if shared.is_killed() {
                return state;
            }
            state = MutableTransaction::new(shared, snapshots).run(state);
            self.refresh_status();
            if shared.is_killed() {
                return state;
            }

            if let Some(tier) = state.first_queued(&Priority::DEFERRING) {
                snapshots.enter(tier, &state);
                next_transaction_id(&mut state);
                if shared.config.trace_universe {
                    debug!(%tier, "deferred_cycle");
                }
                state = MutableTransaction::new(shared, snapshots).step(state, tier);
                continue;
            }

            let orphans: Vec<ObjectId> = orphans(&snapshots.action_start, &state)
                .into_iter()
                .filter(|o| !cleared.contains(o))
                .collect();
            if orphans.is_empty() {
                return state;
            }
            next_transaction_id(&mut state);
            for orphan in &orphans {
                self.clear(&mut state, *orphan, &mut cleared);
            }
            if shared.config.trace_universe {
                debug!(count = orphans.len(), "orphans_cleared");
            }
        }
    }

    /// Remove everything the engine tracks for `object` and its children.
    fn clear(&self, state: &mut State, object: ObjectId, cleared: &mut BTreeSet<ObjectId>) {
        cleared.insert(object);
        if !state.has_object(object) {
            return;
        }
        let registry = &self.shared.registry;
        let mut children = Vec::new();
        for (slot, cell) in state.cells(object) {
            match (slot, cell) {
                (Slot::Dependencies(observer), Cell::Dependencies(deps)) => {
                    let direction = registry
                        .observer(observer)
                        .map(|o| o.direction)
                        .unwrap_or_default();
                    let reader = Reader {
                        target: object,
                        observer,
                    };
                    for (property, observees) in deps.iter() {
                        for observee in observees {
                            remove_reader(state, observee.resolve(object), *property, direction, reader);
                        }
                    }
                    self.shared.stats.instance_removed();
                }
                (Slot::Constructed(observer), Cell::Constructed(made)) => {
                    for (reason, child) in made.iter() {
                        let stale = Construction::derived(object, observer, reason.clone());
                        let mut derivations = state.derivations(*child).as_ref().clone();
                        if derivations.remove(&stale) {
                            let cell = (!derivations.is_empty())
                                .then(|| Cell::Constructions(Arc::new(derivations)));
                            state.put(*child, Slot::Derivations, cell);
                        }
                    }
                }
                (Slot::Property(property), Cell::Value(value)) => {
                    let Ok(spec) = registry.property(property) else {
                        continue;
                    };
                    if spec.containment {
                        let here = Containing {
                            parent: object,
                            property,
                        };
                        children.extend(value.objects().into_iter().filter(|c| state.parent(*c) == Some(here)));
                    }
                    if spec.is_observed() {
                        for direction in [Direction::Forward, Direction::Backward] {
                            for reader in state.readers(object, property, direction).iter() {
                                if reader.target != object {
                                    enqueue(state, Queued::observer(reader.target, reader.observer), direction.priority());
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        state.clear_object(object);
        dequeue_where(state, |q| q.target == object);
        self.shared.forget(object);
        for child in children {
            self.clear(state, child, cleared);
        }
    }

    /// Errors in the objects the action touched, or in every object in dev mode.
    fn check_consistency(&self, pre: &State, post: &State) -> Vec<EngineError> {
        let shared = &self.shared;
        let objects: BTreeSet<ObjectId> = if shared.config.dev_mode {
            post.objects().collect()
        } else {
            pre.diff(post).map(|c| c.object).collect()
        };
        let mut errors = Vec::new();
        for object in objects {
            if !post.has_object(object) {
                continue;
            }
            if !post.is_rooted(object) {
                if shared.config.check_orphan_state {
                    errors.extend(self.orphan_state(post, object));
                }
                continue;
            }
            let Ok(class) = shared.class(object) else {
                continue;
            };
            for property in &class.properties {
                let Ok(spec) = shared.registry.property(*property) else {
                    continue;
                };
                if spec.plumbing || spec.is_constant() || !spec.check_consistency {
                    continue;
                }
                let value = post.get(object, spec);
                if spec.mandatory && value.is_empty() {
                    errors.push(EngineError::NullRequired {
                        object,
                        property: spec.name.to_string(),
                    });
                } else if let Err(message) = spec.check(object, &value) {
                    errors.push(EngineError::Consistency {
                        object,
                        property: spec.name.to_string(),
                        message,
                    });
                }
            }
            for (slot, cell) in post.cells(object) {
                if let (Slot::Exception(observer), Cell::Failure(error)) = (slot, cell) {
                    if shared.registry.observer(observer).is_ok_and(|o| o.checking) {
                        errors.push(error.as_ref().clone());
                    }
                }
            }
        }
        errors
    }

    fn orphan_state(&self, state: &State, object: ObjectId) -> Option<EngineError> {
        let names: Vec<String> = state
            .cells(object)
            .into_iter()
            .filter_map(|(slot, _)| slot.property())
            .filter_map(|p| self.shared.registry.property(p).ok())
            .filter(|spec| !spec.plumbing)
            .map(|spec| spec.name.to_string())
            .collect();
        (!names.is_empty()).then(|| EngineError::OrphanState {
            object,
            properties: names.join(", "),
        })
    }
}

/// Objects touched since `pre` that are no longer reachable from the universe.
fn orphans(pre: &State, post: &State) -> Vec<ObjectId> {
    let touched: BTreeSet<ObjectId> = pre.diff(post).map(|c| c.object).collect();
    touched
        .into_iter()
        .filter(|o| !o.is_universe() && post.has_object(*o) && !post.is_rooted(*o))
        .collect()
}

fn remove_reader(state: &mut State, object: ObjectId, property: PropertyId, direction: Direction, reader: Reader) {
    let mut readers = state.readers(object, property, direction).as_ref().clone();
    if readers.remove(&reader) {
        let cell = (!readers.is_empty()).then(|| Cell::Readers(Arc::new(readers)));
        state.put(object, Slot::Readers(property, direction), cell);
    }
}

/// Settled states before and after the current one.
#[derive(Debug, Default)]
struct Timeline {
    history: VecDeque<State>,
    future: Vec<State>,
    /// History entries that predate initialization.
    floor: usize,
}

impl Timeline {
    fn record(&mut self, previous: State, limit: usize) {
        self.history.push_back(previous);
        self.future.clear();
        while self.history.len() > limit.max(1) {
            self.history.pop_front();
            self.floor = self.floor.saturating_sub(1);
        }
    }

    /// Everything recorded so far is from before initialization finished.
    fn initialized(&mut self) {
        self.floor = self.history.len();
    }

    fn backward(&mut self, current: &State) -> Option<State> {
        if self.history.len() <= self.floor {
            return None;
        }
        let previous = self.history.pop_back()?;
        self.future.push(current.clone());
        Some(previous)
    }

    fn forward(&mut self, current: &State) -> Option<State> {
        let next = self.future.pop()?;
        self.history.push_back(current.clone());
        Some(next)
    }

    /// History, newest first.
    fn recent(&self) -> Arc<Vec<State>> {
        Arc::new(self.history.iter().rev().cloned().collect())
    }
}

fn run_loop(inner: Arc<UniverseInner>) {
    let shared = &inner.shared;
    let mut state = State::new();
    let mut timeline = Timeline::default();
    let mut stopping = false;
    info!("universe_started");

    while let Some(action) = inner.next_action() {
        inner.status.update(|s| {
            s.queued = s.queued.saturating_sub(1);
            s.mood = Mood::Busy;
            s.action = Some(action.name.clone());
        });

        // Some(time_traveling) when the imperatives need the state.
        let mut commit = None;
        match &action.body {
            ActionBody::Stop => stopping = true,
            _ if shared.is_killed() => {
                debug!(action = %action.name, "action_dropped");
            }
            ActionBody::Backward => {
                if let Some(previous) = timeline.backward(&state) {
                    state = previous;
                    commit = Some(true);
                }
            }
            ActionBody::Forward => {
                if let Some(next) = timeline.forward(&state) {
                    state = next;
                    commit = Some(true);
                }
            }
            ActionBody::Commit => commit = Some(false),
            body => {
                let next = inner.run_action(&state, &action, &timeline);
                if next != state {
                    let previous = std::mem::replace(&mut state, next);
                    timeline.record(previous, shared.config.max_nr_of_history);
                }
                if matches!(body, ActionBody::Init(_)) {
                    timeline.initialized();
                }
                commit = Some(false);
            }
        }
        if let Some(time_traveling) = commit {
            if !shared.is_killed() {
                inner.commit_imperatives(&state, time_traveling);
            }
        }

        let finished = stopping || shared.is_killed();
        let stats = shared.stats.snapshot();
        let done = inner.status.update(|s| {
            s.action = None;
            s.completed = Some(action.id);
            s.state = state.clone();
            s.stats = stats;
            if s.queued == 0 {
                s.mood = Mood::Idle;
            }
            finished && s.queued == 0
        });
        if done {
            break;
        }
    }

    inner.status.update(|s| {
        s.mood = Mood::Stopped;
        s.action = None;
        s.state = state.clone();
    });
    info!(errors = shared.errors().len(), "universe_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(n: u64) -> State {
        State::new().with(ObjectId(1), Slot::ChangeId, Some(Cell::Counter(n)))
    }

    #[test]
    fn test_backward_stops_at_initialization() {
        let mut timeline = Timeline::default();
        timeline.record(state(0), 10);
        timeline.initialized();
        assert!(timeline.backward(&state(1)).is_none());

        timeline.record(state(1), 10);
        assert_eq!(timeline.backward(&state(2)), Some(state(1)));
        assert!(timeline.backward(&state(1)).is_none());
        assert_eq!(timeline.forward(&state(1)), Some(state(2)));
        assert!(timeline.forward(&state(2)).is_none());
    }

    #[test]
    fn test_record_clears_future_and_trims() {
        let mut timeline = Timeline::default();
        for n in 0..5 {
            timeline.record(state(n), 3);
        }
        assert_eq!(timeline.history.len(), 3);
        assert_eq!(timeline.recent()[0], state(4));

        timeline.backward(&state(5));
        assert_eq!(timeline.future.len(), 1);
        timeline.record(state(9), 3);
        assert!(timeline.future.is_empty());
    }

    #[test]
    fn test_orphans_are_touched_and_unrooted() {
        let pre = State::new();
        let mut post = pre.clone();
        post.put(ObjectId(1), Slot::Active, Some(Cell::Flag));
        post.put(
            ObjectId(2),
            Slot::Parent,
            Some(Cell::Parent(Containing {
                parent: ObjectId::UNIVERSE,
                property: PropertyId(0),
            })),
        );
        assert_eq!(orphans(&pre, &post), vec![ObjectId(1)]);
    }
}
