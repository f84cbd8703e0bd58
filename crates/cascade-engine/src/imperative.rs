//! Imperative bridges: two-way sync between the engine and outside code.
//!
//! An imperative keeps its own view of the state. After every settled
//! action the universe pushes the new state through the chain of registered
//! imperatives; each one computes the delta against its view and hands it to
//! its handler on its own [`Scheduler`]. Values the outside world sets on an
//! imperative travel back into the engine as an action.
//!
//! ```text
//! universe ──commit──▶ imperative A ──view──▶ imperative B ──▶ …
//!     ▲                    │ set()
//!     └──── $set action ───┘
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use cascade_core::{
    EngineError, EngineResult, ObjectId, PropertyChange, PropertyId, Registry, State, Value,
};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::transaction::{panic_message, ActionBody, Transaction, TransactionKind};
use crate::universe::UniverseInner;

/// A unit of work handed to a scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs imperative commits, in submission order.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: Job);
}

/// Runs jobs on the calling thread, which is the universe thread for commits.
///
/// Handlers must not block on the universe from here.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, job: Job) {
        job();
    }
}

/// Runs jobs on one dedicated thread.
pub struct ThreadScheduler {
    sender: Sender<Job>,
}

impl ThreadScheduler {
    pub fn new(name: &str) -> EngineResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .map_err(|e| EngineError::failed(format!("cannot spawn scheduler {name}: {e}")))?;
        Ok(Self { sender })
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, job: Job) {
        if self.sender.send(job).is_err() {
            warn!("scheduler_closed");
        }
    }
}

/// Runs jobs on a blocking task of a tokio runtime.
#[cfg(feature = "tokio")]
pub struct TokioScheduler {
    sender: tokio::sync::mpsc::UnboundedSender<Job>,
}

#[cfg(feature = "tokio")]
impl TokioScheduler {
    pub fn new(handle: &tokio::runtime::Handle) -> Self {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Job>();
        handle.spawn_blocking(move || {
            while let Some(job) = receiver.blocking_recv() {
                job();
            }
        });
        Self { sender }
    }
}

#[cfg(feature = "tokio")]
impl Scheduler for TokioScheduler {
    fn schedule(&self, job: Job) {
        if self.sender.send(job).is_err() {
            warn!("scheduler_closed");
        }
    }
}

/// What changed since the last commit an imperative saw.
pub struct Delta<'a> {
    /// The imperative's previous view.
    pub pre: &'a State,
    /// Its new view: the engine state plus values not yet absorbed.
    pub post: &'a State,
    /// The engine absorbed everything this imperative set.
    pub last: bool,
    /// Values set since the engine last caught up.
    pub setted: &'a BTreeMap<(ObjectId, PropertyId), Value>,
    pub time_traveling: bool,
}

impl<'a> Delta<'a> {
    pub fn changes(&self) -> impl Iterator<Item = PropertyChange> + 'a {
        self.pre.property_changes(self.post)
    }
}

/// Callback receiving every delta of an imperative.
pub type DeltaHandler = Arc<dyn Fn(&ImperativeTransaction, &Delta<'_>) + Send + Sync>;

#[derive(Default)]
struct View {
    /// What the outside world sees.
    state: State,
    /// Last engine state committed.
    engine: State,
    /// Values set and not yet sent.
    setted: BTreeMap<(ObjectId, PropertyId), Value>,
    /// Values set and not yet absorbed.
    all_setted: BTreeMap<(ObjectId, PropertyId), Value>,
    change_nr: u64,
    dirty: bool,
    committing: bool,
}

thread_local! {
    static CURRENT: RefCell<Option<Weak<ImperativeTransaction>>> = const { RefCell::new(None) };
}

pub struct ImperativeTransaction {
    index: u32,
    name: Arc<str>,
    registry: Arc<Registry>,
    universe: Weak<UniverseInner>,
    scheduler: Arc<dyn Scheduler>,
    handler: DeltaHandler,
    keep_affinity: bool,
    view: Mutex<View>,
}

impl ImperativeTransaction {
    pub(crate) fn new(
        index: u32,
        name: &str,
        registry: Arc<Registry>,
        universe: Weak<UniverseInner>,
        scheduler: Arc<dyn Scheduler>,
        handler: DeltaHandler,
        keep_affinity: bool,
    ) -> Self {
        Self {
            index,
            name: Arc::from(name),
            registry,
            universe,
            scheduler,
            handler,
            keep_affinity,
            view: Mutex::new(View::default()),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The imperative whose commit last ran on this thread.
    ///
    /// Only stays set between commits when the imperative keeps affinity.
    pub fn current() -> Option<Arc<ImperativeTransaction>> {
        CURRENT.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Value in this imperative's view.
    pub fn get(&self, object: ObjectId, property: PropertyId) -> EngineResult<Value> {
        let spec = self.registry.property(property)?;
        Ok(self.view.lock().state.get(object, spec))
    }

    /// Snapshot of this imperative's view.
    pub fn state(&self) -> State {
        self.view.lock().state.clone()
    }

    /// Set a value from outside; it reaches the engine with the next commit.
    pub fn set(&self, object: ObjectId, property: PropertyId, value: impl Into<Value>) -> EngineResult<()> {
        let spec = self.registry.property(property)?;
        let value = value.into();
        let request_commit = {
            let mut view = self.view.lock();
            let old = view.state.set_value(object, spec, value.clone());
            if old == value {
                return Ok(());
            }
            view.setted.insert((object, property), value.clone());
            view.all_setted.insert((object, property), value);
            if view.dirty {
                false
            } else {
                view.dirty = true;
                view.change_nr += 1;
                !view.committing
            }
        };
        if request_commit {
            let universe = self.universe.upgrade().ok_or(EngineError::Killed)?;
            universe.enqueue_internal("$commit", ActionBody::Commit)?;
        }
        Ok(())
    }

    /// Commit `state` to every imperative of `chain` from `index` on, each
    /// on its own scheduler, passing each view to the next.
    pub(crate) fn commit_chain(
        chain: Arc<Vec<Arc<ImperativeTransaction>>>,
        index: usize,
        state: State,
        time_traveling: bool,
    ) {
        let Some(imperative) = chain.get(index).cloned() else {
            return;
        };
        let scheduler = imperative.scheduler.clone();
        scheduler.schedule(Box::new(move || {
            let view = imperative.commit(state, time_traveling);
            Self::commit_chain(chain, index + 1, view, time_traveling);
        }));
    }

    fn commit(self: &Arc<Self>, engine: State, time_traveling: bool) -> State {
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::downgrade(self)));
        let delta = {
            let mut view = self.view.lock();
            view.committing = true;
            let last = view.setted.is_empty() && engine.absorbed(self.index) >= view.change_nr;
            if last {
                view.all_setted.clear();
            }
            if engine == view.engine {
                None
            } else {
                let mut post = engine.clone();
                for ((object, property), value) in &view.all_setted {
                    if let Ok(spec) = self.registry.property(*property) {
                        post.set_value(*object, spec, value.clone());
                    }
                }
                let pre = std::mem::replace(&mut view.state, post.clone());
                view.engine = engine;
                Some((pre, post, last, view.all_setted.clone()))
            }
        };

        if let Some((pre, post, last, setted)) = delta {
            if pre != post {
                let delta = Delta {
                    pre: &pre,
                    post: &post,
                    last,
                    setted: &setted,
                    time_traveling,
                };
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (self.handler)(self, &delta))) {
                    let message = panic_message(payload);
                    error!(imperative = %self.name, %message, "imperative_panicked");
                    if let Some(universe) = self.universe.upgrade() {
                        universe
                            .shared
                            .fail(EngineError::failed(format!("imperative {} panicked: {message}", self.name)));
                    }
                }
            }
        }

        let (view, values, change_nr) = {
            let mut view = self.view.lock();
            view.committing = false;
            view.dirty = false;
            let values: Vec<(ObjectId, PropertyId, Value)> = std::mem::take(&mut view.setted)
                .into_iter()
                .map(|((o, p), v)| (o, p, v))
                .collect();
            (view.state.clone(), values, view.change_nr)
        };
        if let Some(universe) = self.universe.upgrade() {
            if !values.is_empty() {
                debug!(imperative = %self.name, values = values.len(), change_nr, "imperative_send");
                let body = ActionBody::Imperative {
                    index: self.index,
                    change_nr,
                    values: Arc::new(values),
                };
                if let Err(e) = universe.enqueue_internal(&format!("{}$set", self.name), body) {
                    warn!(imperative = %self.name, error = %e, "imperative_send_dropped");
                }
            }
            universe.deactivate(&self.name);
        }
        if !self.keep_affinity {
            CURRENT.with(|c| *c.borrow_mut() = None);
        }
        view
    }
}

impl Transaction for ImperativeTransaction {
    fn kind(&self) -> TransactionKind {
        TransactionKind::Imperative
    }

    fn target(&self) -> ObjectId {
        ObjectId::UNIVERSE
    }
}

/// Registered imperatives and their declared commit order.
#[derive(Default)]
pub(crate) struct ImperativeSet {
    members: Vec<Arc<ImperativeTransaction>>,
    edges: BTreeSet<(u32, u32)>,
}

impl ImperativeSet {
    pub fn next_index(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn add(&mut self, imperative: Arc<ImperativeTransaction>) {
        self.members.push(imperative);
    }

    /// Declare that `first` commits before `second`.
    pub fn order(&mut self, first: u32, second: u32) -> EngineResult<()> {
        if let Some(path) = path(&self.edges, second, first) {
            let names: Vec<String> = std::iter::once(first)
                .chain(path)
                .map(|i| self.name(i))
                .collect();
            return Err(EngineError::OrderingCycle {
                path: names.join(" -> "),
            });
        }
        self.edges.insert((first, second));
        Ok(())
    }

    /// Members in commit order.
    pub fn ordered(&self) -> Vec<Arc<ImperativeTransaction>> {
        topological(self.members.len() as u32, &self.edges)
            .into_iter()
            .filter_map(|i| self.members.get(i as usize).cloned())
            .collect()
    }

    fn name(&self, index: u32) -> String {
        self.members
            .get(index as usize)
            .map(|m| m.name.to_string())
            .unwrap_or_else(|| index.to_string())
    }
}

/// Path from `from` to `to` along `edges`, both ends included.
fn path(edges: &BTreeSet<(u32, u32)>, from: u32, to: u32) -> Option<Vec<u32>> {
    let mut stack = vec![vec![from]];
    let mut seen = BTreeSet::from([from]);
    while let Some(route) = stack.pop() {
        let last = *route.last()?;
        if last == to {
            return Some(route);
        }
        for (_, next) in edges.range((last, 0)..=(last, u32::MAX)) {
            if seen.insert(*next) {
                let mut longer = route.clone();
                longer.push(*next);
                stack.push(longer);
            }
        }
    }
    None
}

/// Kahn's algorithm; ties go to the earliest registered.
fn topological(count: u32, edges: &BTreeSet<(u32, u32)>) -> Vec<u32> {
    let mut incoming = vec![0usize; count as usize];
    for (_, to) in edges {
        if let Some(n) = incoming.get_mut(*to as usize) {
            *n += 1;
        }
    }
    let mut ready: BTreeSet<u32> = (0..count).filter(|i| incoming[*i as usize] == 0).collect();
    let mut order = Vec::with_capacity(count as usize);
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for (_, to) in edges.range((next, 0)..=(next, u32::MAX)) {
            let n = &mut incoming[*to as usize];
            *n -= 1;
            if *n == 0 {
                ready.insert(*to);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{PropertySpec, RegistryBuilder};

    fn imperative(index: u32, name: &str) -> Arc<ImperativeTransaction> {
        let mut builder = RegistryBuilder::new();
        builder.property(PropertySpec::setable("x"));
        let registry = Arc::new(builder.build().unwrap());
        let handler: DeltaHandler = Arc::new(|_: &ImperativeTransaction, _: &Delta<'_>| {});
        Arc::new(ImperativeTransaction::new(
            index,
            name,
            registry,
            Weak::new(),
            Arc::new(InlineScheduler),
            handler,
            false,
        ))
    }

    fn set_of(names: &[&str]) -> ImperativeSet {
        let mut set = ImperativeSet::default();
        for name in names {
            let index = set.next_index();
            set.add(imperative(index, name));
        }
        set
    }

    fn names(set: &ImperativeSet) -> Vec<String> {
        set.ordered().iter().map(|i| i.name().to_string()).collect()
    }

    #[test]
    fn test_unordered_keeps_registration_order() {
        let set = set_of(&["a", "b", "c"]);
        assert_eq!(names(&set), ["a", "b", "c"]);
    }

    #[test]
    fn test_declared_order_wins() {
        let mut set = set_of(&["a", "b", "c"]);
        set.order(2, 0).unwrap();
        set.order(1, 2).unwrap();
        assert_eq!(names(&set), ["b", "c", "a"]);
    }

    #[test]
    fn test_cycle_is_rejected_with_path() {
        let mut set = set_of(&["a", "b", "c"]);
        set.order(0, 1).unwrap();
        set.order(1, 2).unwrap();
        let err = set.order(2, 0).unwrap_err();
        match err {
            EngineError::OrderingCycle { path } => assert_eq!(path, "c -> a -> b -> c"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(names(&set), ["a", "b", "c"]);
    }

    #[test]
    fn test_self_order_is_a_cycle() {
        let mut set = set_of(&["a"]);
        assert!(set.order(0, 0).is_err());
    }

    #[test]
    fn test_set_without_universe_reports_killed() {
        let imp = imperative(0, "ui");
        let result = imp.set(ObjectId(1), PropertyId(0), 3);
        assert!(matches!(result, Err(EngineError::Killed)));
        assert_eq!(imp.get(ObjectId(1), PropertyId(0)).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_thread_scheduler_runs_in_order() {
        let scheduler = ThreadScheduler::new("test-scheduler").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..5 {
            let tx = tx.clone();
            scheduler.schedule(Box::new(move || tx.send(i).unwrap()));
        }
        let got: Vec<i32> = (0..5).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, [0, 1, 2, 3, 4]);
    }
}
