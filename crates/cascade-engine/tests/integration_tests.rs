//! Integration tests for cascade-engine driving whole universes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cascade_engine::{
    ClassId, ClassSpec, Delta, Derivation, EngineConfig, EngineError, ImperativeTransaction,
    InlineScheduler, Leaf, Mood, NewableSpec, ObjectId, ObserverSpec, Priority, PropertyId,
    PropertySpec, Reason, Registry, RegistryBuilder, State, ThreadScheduler, UniverseTransaction,
    Value,
};
use parking_lot::Mutex;
use serde_json::json;

// ============================================================================
// Models
// ============================================================================

/// `y = x + 1` on every node contained in the universe.
struct Chain {
    registry: Registry,
    children: PropertyId,
    x: PropertyId,
    y: PropertyId,
    node: ClassId,
}

fn chain() -> Chain {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let x = b.property(PropertySpec::observed("x").with_default(0));
    let y = b.property(PropertySpec::observed("y").with_default(0));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([x, y]));
    b.observer(
        node,
        ObserverSpec::new("y = x + 1", move |tx| {
            let t = tx.target();
            let v = tx.get_int(t, x)?.unwrap_or(0);
            tx.set(t, y, Value::Int(v + 1))
        })
        .deriving([y]),
    )
    .unwrap();
    Chain {
        registry: b.build().unwrap(),
        children,
        x,
        y,
        node,
    }
}

/// A node deriving one item per tag, each carrying the tag as label.
struct Tree {
    registry: Registry,
    children: PropertyId,
    tags: PropertyId,
    items: PropertyId,
    label: PropertyId,
    node: ClassId,
    item: ClassId,
}

fn tree() -> Tree {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let tags = b.property(PropertySpec::observed("tags"));
    let items = b.property(PropertySpec::observed("items").containment());
    let label = b.property(PropertySpec::setable("label"));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([tags, items]));
    let item = b.class(
        ClassSpec::new("Item")
            .with_properties([label])
            .newable(NewableSpec::new("Item").with_identity(move |tx, o| tx.get(o, label))),
    );
    b.observer(
        node,
        ObserverSpec::new("items from tags", move |tx| {
            let t = tx.target();
            let mut derived = Vec::new();
            for tag in tx.get(t, tags)?.elements() {
                let child = tx.construct(Reason::new(t, "tag", [tag.clone()]), item)?;
                tx.set(child, label, tag)?;
                derived.push(Value::Object(child));
            }
            tx.set(t, items, Value::list(derived))
        }),
    )
    .unwrap();
    Tree {
        registry: b.build().unwrap(),
        children,
        tags,
        items,
        label,
        node,
        item,
    }
}

fn value(universe: &UniverseTransaction, state: &State, object: ObjectId, property: PropertyId) -> Value {
    state.get(object, universe.registry().property(property).unwrap())
}

fn sequential() -> EngineConfig {
    EngineConfig::default().with_run_sequential(true)
}

fn texts(values: &[&str]) -> Value {
    Value::list(values.iter().map(|t| Value::from(*t)))
}

// ============================================================================
// Settling
// ============================================================================

#[test]
fn test_chain_settles_after_each_action() {
    let m = chain();
    let (children, x, y, node) = (m.children, m.x, m.y, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let a = universe.new_object(node, "a");

    let state = universe
        .put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()))
        .unwrap();
    assert_eq!(value(&universe, &state, a, y), Value::Int(1));

    let state = universe.put_and_wait("x=3", move |tx| tx.set(a, x, 3.into())).unwrap();
    assert_eq!(value(&universe, &state, a, x), Value::Int(3));
    assert_eq!(value(&universe, &state, a, y), Value::Int(4));

    let status = universe.status();
    assert_eq!(status.mood, Mood::Idle);
    assert!(universe.stats().actions >= 3);

    universe.stop();
    let end = universe.wait_for_end().unwrap();
    assert_eq!(value(&universe, &end, a, y), Value::Int(4));
}

#[test]
fn test_parallel_and_sequential_runs_agree() {
    let run = |config: EngineConfig| {
        let m = chain();
        let (children, x, node) = (m.children, m.x, m.node);
        let universe = UniverseTransaction::start(m.registry, config).unwrap();
        let nodes: Vec<ObjectId> = (0..8).map(|i| universe.new_object(node, &format!("n{i}"))).collect();
        let added = nodes.clone();
        universe
            .put_and_wait("add", move |tx| {
                for (i, n) in added.iter().enumerate() {
                    tx.add(ObjectId::UNIVERSE, children, (*n).into())?;
                    tx.set(*n, x, Value::Int(i as i64 * 10))?;
                }
                Ok(())
            })
            .unwrap();
        universe.to_json(ObjectId::UNIVERSE)
    };
    let sequential = run(sequential());
    let parallel = run(EngineConfig::default().with_parallelism(4));
    assert_eq!(sequential, parallel);
}

#[test]
fn test_json_export_of_settled_state() {
    let m = chain();
    let (children, x, node) = (m.children, m.x, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let a = universe.new_object(node, "a");
    universe
        .put_and_wait("setup", move |tx| {
            tx.add(ObjectId::UNIVERSE, children, a.into())?;
            tx.set(a, x, 3.into())
        })
        .unwrap();

    assert_eq!(
        universe.to_json(ObjectId::UNIVERSE),
        json!({
            "@id": "0",
            "name": "universe",
            "children": [
                { "@id": a.to_string(), "name": "a", "x": 3, "y": 4 }
            ]
        })
    );
}

// ============================================================================
// Construction and matching
// ============================================================================

#[test]
fn test_constructed_objects_are_memoized() {
    let m = tree();
    let (children, tags, items, label, node) = (m.children, m.tags, m.items, m.label, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let n = universe.new_object(node, "n");

    let first = universe
        .put_and_wait("add", move |tx| {
            tx.add(ObjectId::UNIVERSE, children, n.into())?;
            tx.set(n, tags, texts(&["a", "b"]))
        })
        .unwrap();
    let before = value(&universe, &first, n, items).elements();
    assert_eq!(before.len(), 2);
    let labels: Vec<Value> = before
        .iter()
        .filter_map(Value::as_object)
        .map(|o| value(&universe, &first, o, label))
        .collect();
    assert_eq!(labels, vec![Value::from("a"), Value::from("b")]);

    let second = universe
        .put_and_wait("grow", move |tx| tx.set(n, tags, texts(&["a", "b", "c"])))
        .unwrap();
    let after = value(&universe, &second, n, items).elements();
    assert_eq!(after.len(), 3);
    assert_eq!(&after[..2], &before[..]);
    assert!(after.iter().filter_map(Value::as_object).all(ObjectId::is_derived));
}

#[test]
fn test_derived_ids_are_deterministic_across_universes() {
    let run = || {
        let m = tree();
        let (children, tags, node) = (m.children, m.tags, m.node);
        let universe = UniverseTransaction::start(m.registry, EngineConfig::default()).unwrap();
        let n = universe.new_object(node, "n");
        universe
            .put_and_wait("add", move |tx| {
                tx.add(ObjectId::UNIVERSE, children, n.into())?;
                tx.set(n, tags, texts(&["x", "y", "z"]))
            })
            .unwrap();
        universe.to_json(ObjectId::UNIVERSE)
    };
    assert_eq!(run(), run());
}

#[test]
fn test_carved_object_wins_match() {
    let m = tree();
    let (children, tags, items, label, node, item) = (m.children, m.tags, m.items, m.label, m.node, m.item);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let n = universe.new_object(node, "n");
    universe
        .put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, n.into()))
        .unwrap();

    let carved = Arc::new(Mutex::new(None));
    let slot = carved.clone();
    let state = universe
        .put_and_wait("carve", move |tx| {
            let a = tx.construct(Reason::new(n, "manual", [Value::from("a")]), item)?;
            tx.set(a, label, "a".into())?;
            tx.set(n, items, Value::list([Value::Object(a)]))?;
            tx.set(n, tags, texts(&["a", "b"]))?;
            *slot.lock() = Some(a);
            Ok(())
        })
        .unwrap();

    let a = carved.lock().unwrap();
    assert!(!a.is_derived());
    let result = value(&universe, &state, n, items).elements();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0], Value::Object(a));
    let b = result[1].as_object().unwrap();
    assert_eq!(value(&universe, &state, b, label), Value::from("b"));
    let count = result.iter().filter(|v| value(&universe, &state, v.as_object().unwrap(), label) == Value::from("a")).count();
    assert_eq!(count, 1);
}

// ============================================================================
// Orphans, checks and failures
// ============================================================================

#[test]
fn test_removed_node_is_cleared() {
    let m = chain();
    let (children, x, node) = (m.children, m.x, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let a = universe.new_object(node, "a");
    let b = universe.new_object(node, "b");
    universe
        .put_and_wait("add", move |tx| {
            tx.add(ObjectId::UNIVERSE, children, a.into())?;
            tx.add(ObjectId::UNIVERSE, children, b.into())?;
            tx.set(a, x, 5.into())
        })
        .unwrap();

    let state = universe
        .put_and_wait("remove", move |tx| tx.remove(ObjectId::UNIVERSE, children, &Value::from(a)))
        .unwrap();
    assert!(!state.has_object(a));
    assert!(state.is_active(b));
}

#[test]
fn test_mandatory_violation_kills() {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let name = b.property(PropertySpec::setable("name").mandatory());
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([name]));
    let universe = UniverseTransaction::start(b.build().unwrap(), sequential()).unwrap();
    let a = universe.new_object(node, "a");

    let result = universe.put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()));
    assert!(matches!(result, Err(EngineError::NullRequired { .. })));
    assert!(universe.is_killed());
}

#[test]
fn test_runaway_toggle_reports_too_many_changes() {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let flag = b.property(PropertySpec::observed("flag").with_default(false));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([flag]));
    b.observer(
        node,
        ObserverSpec::new("toggle", move |tx| {
            let t = tx.target();
            let on = tx.get_bool(t, flag)?;
            tx.set(t, flag, (!on).into())
        }),
    )
    .unwrap();
    let universe = UniverseTransaction::start(b.build().unwrap(), sequential()).unwrap();
    let a = universe.new_object(node, "a");

    let result = universe.put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()));
    assert!(matches!(result, Err(EngineError::TooManyChanges { .. })));
    assert!(matches!(universe.wait_for_end(), Err(EngineError::TooManyChanges { .. })));
}

#[test]
fn test_constant_reading_observed_state_is_nondeterministic() {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let x = b.property(PropertySpec::observed("x").with_default(1));
    let doubled = b.property(PropertySpec::constant("doubled", move |tx, o| {
        Ok(Value::Int(tx.get_int(o, x)?.unwrap_or(0) * 2))
    }));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([x, doubled]));
    b.observer(
        node,
        ObserverSpec::new("read doubled", move |tx| {
            let t = tx.target();
            tx.get(t, doubled).map(|_| ())
        }),
    )
    .unwrap();
    let universe = UniverseTransaction::start(b.build().unwrap(), sequential()).unwrap();
    let a = universe.new_object(node, "a");

    let result = universe.put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()));
    assert!(matches!(result, Err(EngineError::NonDeterministic { .. })));
}

#[test]
fn test_observer_panic_is_reported() {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node"));
    b.observer(node, ObserverSpec::new("explode", |_| panic!("boom"))).unwrap();
    let universe = UniverseTransaction::start(b.build().unwrap(), sequential()).unwrap();
    let a = universe.new_object(node, "a");

    let result = universe.put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()));
    match result {
        Err(EngineError::ObserverFailed { observer, message, .. }) => {
            assert_eq!(observer, "explode");
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_put_after_kill_is_rejected() {
    let m = chain();
    let x = m.x;
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    universe.kill();
    let result = universe.put("late", move |tx| tx.set(ObjectId::UNIVERSE, x, 1.into()));
    assert_eq!(result, Err(EngineError::Killed));
    assert!(universe.wait_for_end().is_ok());
}

// ============================================================================
// History and derivation
// ============================================================================

#[test]
fn test_backward_and_forward() {
    let m = chain();
    let (children, x, y, node) = (m.children, m.x, m.y, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let a = universe.new_object(node, "a");
    universe
        .put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()))
        .unwrap();
    universe.put_and_wait("x=3", move |tx| tx.set(a, x, 3.into())).unwrap();
    universe.put_and_wait("x=5", move |tx| tx.set(a, x, 5.into())).unwrap();

    universe.backward().unwrap();
    let state = universe.wait_for_idle().state;
    assert_eq!(value(&universe, &state, a, y), Value::Int(4));

    universe.forward().unwrap();
    let state = universe.wait_for_idle().state;
    assert_eq!(value(&universe, &state, a, y), Value::Int(6));
}

#[test]
fn test_derive_reports_how_a_value_is_obtained() {
    let m = chain();
    let (children, x, y, node) = (m.children, m.x, m.y, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let a = universe.new_object(node, "a");
    universe
        .put_and_wait("setup", move |tx| {
            tx.add(ObjectId::UNIVERSE, children, a.into())?;
            tx.set(a, x, 3.into())
        })
        .unwrap();

    assert_eq!(universe.derive(a, y).unwrap(), Derivation::Derived(Value::Int(4)));
    assert_eq!(universe.derive(a, x).unwrap(), Derivation::NotDerived(Value::Int(3)));
}

// ============================================================================
// Imperatives
// ============================================================================

/// Counts deltas in which `flag` of any object turned on.
fn flag_counter(flag: PropertyId, count: Arc<AtomicUsize>) -> impl Fn(&ImperativeTransaction, &Delta<'_>) + Send + Sync {
    move |_, delta| {
        for change in delta.changes() {
            if change.property == flag && change.new == Some(Value::Bool(true)) {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

fn flag_model() -> (Registry, PropertyId, PropertyId, ClassId) {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let flag = b.property(PropertySpec::observed("flag").with_default(false));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([flag]));
    (b.build().unwrap(), children, flag, node)
}

#[test]
fn test_every_imperative_sees_a_change_once() {
    let (registry, children, flag, node) = flag_model();
    let universe = UniverseTransaction::start(registry, sequential()).unwrap();
    let a = universe.new_object(node, "a");
    universe
        .put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()))
        .unwrap();

    let left = Arc::new(AtomicUsize::new(0));
    let right = Arc::new(AtomicUsize::new(0));
    universe.add_imperative(
        "left",
        flag_counter(flag, left.clone()),
        Arc::new(ThreadScheduler::new("left").unwrap()),
        false,
    );
    universe.add_imperative(
        "right",
        flag_counter(flag, right.clone()),
        Arc::new(ThreadScheduler::new("right").unwrap()),
        false,
    );

    universe.put_and_wait("flip", move |tx| tx.set(a, flag, true.into())).unwrap();
    assert_eq!(left.load(Ordering::SeqCst), 1);
    assert_eq!(right.load(Ordering::SeqCst), 1);
}

#[test]
fn test_ordered_imperatives_see_changes_in_order() {
    let (registry, children, flag, node) = flag_model();
    let universe = UniverseTransaction::start(registry, sequential()).unwrap();
    let a = universe.new_object(node, "a");
    universe
        .put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()))
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let logger = |name: &'static str| {
        let log = log.clone();
        move |_: &ImperativeTransaction, delta: &Delta<'_>| {
            if delta.changes().any(|c| c.property == flag) {
                log.lock().push(name);
            }
        }
    };
    let first = universe.add_imperative("first", logger("first"), Arc::new(ThreadScheduler::new("first").unwrap()), false);
    let second = universe.add_imperative("second", logger("second"), Arc::new(ThreadScheduler::new("second").unwrap()), false);
    universe.order_imperatives(&second, &first).unwrap();

    universe.put_and_wait("flip", move |tx| tx.set(a, flag, true.into())).unwrap();
    assert_eq!(*log.lock(), vec!["second", "first"]);
}

#[test]
fn test_ordering_cycle_kills() {
    let (registry, ..) = flag_model();
    let universe = UniverseTransaction::start(registry, sequential()).unwrap();
    let noop = |_: &ImperativeTransaction, _: &Delta<'_>| {};
    let a = universe.add_imperative("a", noop, Arc::new(ThreadScheduler::new("a").unwrap()), false);
    let b = universe.add_imperative("b", noop, Arc::new(ThreadScheduler::new("b").unwrap()), false);
    universe.order_imperatives(&a, &b).unwrap();

    let result = universe.order_imperatives(&b, &a);
    assert!(matches!(result, Err(EngineError::OrderingCycle { .. })));
    assert!(matches!(universe.wait_for_end(), Err(EngineError::OrderingCycle { .. })));
}

#[test]
fn test_imperative_writes_flow_into_the_engine() {
    let m = chain();
    let (children, x, y, node) = (m.children, m.x, m.y, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let a = universe.new_object(node, "a");
    universe
        .put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()))
        .unwrap();

    let ui = universe.add_imperative(
        "ui",
        |_: &ImperativeTransaction, _: &Delta<'_>| {},
        Arc::new(ThreadScheduler::new("ui").unwrap()),
        false,
    );
    universe.wait_for_idle();
    ui.set(a, x, 10).unwrap();

    let settled = universe
        .status_provider()
        .wait_for_timeout(|s| s.is_idle() && s.state.value(a, y) == Some(&Value::Int(11)), Duration::from_secs(10));
    assert!(settled.is_some());
    assert_eq!(ui.get(a, y).unwrap(), Value::Int(11));
}

// ============================================================================
// Deferral across tiers
// ============================================================================

#[test]
fn test_readd_within_inner_cycle_is_deferred() {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let tags = b.property(PropertySpec::observed("tags"));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([tags]));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    b.observer(
        node,
        ObserverSpec::new("keep pinned", move |tx| {
            let t = tx.target();
            let current = tx.get(t, tags)?;
            log.lock().push(current.clone());
            if current.contains(&Value::from("keep")) {
                return Ok(());
            }
            tx.add(t, tags, "keep".into())
        }),
    )
    .unwrap();
    let universe = UniverseTransaction::start(b.build().unwrap(), sequential()).unwrap();
    let n = universe.new_object(node, "n");
    universe
        .put_and_wait("add", move |tx| {
            tx.add(ObjectId::UNIVERSE, children, n.into())?;
            tx.set(n, tags, texts(&["keep"]))
        })
        .unwrap();
    seen.lock().clear();

    let state = universe
        .put_and_wait("unpin", move |tx| tx.set(n, tags, Value::empty_list()))
        .unwrap();

    // The first run keeps the removal; the re-add lands in the inner cycle.
    assert_eq!(
        *seen.lock(),
        vec![Value::empty_list(), Value::empty_list(), texts(&["keep"])]
    );
    assert_eq!(value(&universe, &state, n, tags), texts(&["keep"]));
}

#[test]
fn test_new_observer_undoing_action_write_is_deferred_to_four() {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let pending = b.property(PropertySpec::setable("pending"));
    let slot = b.property(PropertySpec::observed("slot").containment());
    let mode = b.property(PropertySpec::observed("mode").with_default("auto"));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let holder = b.class(ClassSpec::new("Holder").with_properties([pending, slot]));
    let target = b.class(ClassSpec::new("Target").with_properties([mode]));
    b.observer(
        holder,
        ObserverSpec::new("adopt", move |tx| {
            let t = tx.target();
            let wanted = tx.get(t, pending)?;
            tx.set(t, slot, wanted)
        })
        .with_priority(Priority::Four),
    )
    .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    b.observer(
        target,
        ObserverSpec::new("undo", move |tx| {
            let t = tx.target();
            log.lock().push(tx.get(t, mode)?);
            tx.set(t, mode, "auto".into())
        }),
    )
    .unwrap();
    let universe = UniverseTransaction::start(b.build().unwrap(), sequential()).unwrap();
    let h = universe.new_object(holder, "h");
    let t = universe.new_object(target, "t");

    let state = universe
        .put_and_wait("adopt manual", move |tx| {
            tx.set(t, mode, "manual".into())?;
            tx.set(h, pending, t.into())?;
            tx.add(ObjectId::UNIVERSE, children, h.into())
        })
        .unwrap();

    // The action's write survives the first run and is undone at four.
    assert_eq!(
        *seen.lock(),
        vec![Value::from("manual"), Value::from("manual"), Value::from("auto")]
    );
    assert_eq!(value(&universe, &state, t, mode), Value::from("auto"));
    assert_eq!(value(&universe, &state, h, slot), Value::Object(t));
}

// ============================================================================
// Matching and history
// ============================================================================

/// Items keyed by lower-cased tag, so `"a"` and `"A"` derive the same item.
struct Catalog {
    registry: Registry,
    children: PropertyId,
    tags: PropertyId,
    items: PropertyId,
    label: PropertyId,
    note: PropertyId,
    node: ClassId,
    /// Notes of the constructed items, read after each write of `items`.
    notes: Arc<Mutex<Vec<Vec<Value>>>>,
}

fn catalog(as_set: bool) -> Catalog {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let tags = b.property(PropertySpec::observed("tags"));
    let items = b.property(PropertySpec::observed("items").containment());
    let label = b.property(PropertySpec::setable("label"));
    let note = b.property(PropertySpec::setable("note"));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([tags, items]));
    let item = b.class(
        ClassSpec::new("Item")
            .with_properties([label, note])
            .newable(NewableSpec::new("Item").with_identity(move |tx, o| tx.get(o, label))),
    );
    let notes = Arc::new(Mutex::new(Vec::new()));
    let log = notes.clone();
    b.observer(
        node,
        ObserverSpec::new("items from tags", move |tx| {
            let t = tx.target();
            let mut made = Vec::new();
            for tag in tx.get(t, tags)?.elements() {
                let key = tag.as_text().map(str::to_lowercase).unwrap_or_default();
                let child = tx.construct(Reason::new(t, "tag", [tag.clone()]), item)?;
                tx.set(child, label, key.into())?;
                made.push(child);
            }
            let values = made.iter().map(|c| Value::Object(*c));
            let wanted = if as_set { Value::set(values) } else { Value::list(values) };
            tx.set(t, items, wanted)?;
            let mut seen = Vec::new();
            for child in made {
                seen.push(tx.get(child, note)?);
            }
            log.lock().push(seen);
            Ok(())
        }),
    )
    .unwrap();
    Catalog {
        registry: b.build().unwrap(),
        children,
        tags,
        items,
        label,
        note,
        node,
        notes,
    }
}

#[test]
fn test_matched_items_keep_ids_and_old_order() {
    let m = catalog(false);
    let (children, tags, items, label, node) = (m.children, m.tags, m.items, m.label, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let n = universe.new_object(node, "n");
    let first = universe
        .put_and_wait("add", move |tx| {
            tx.add(ObjectId::UNIVERSE, children, n.into())?;
            tx.set(n, tags, texts(&["a", "b"]))
        })
        .unwrap();
    let before = value(&universe, &first, n, items);
    assert_eq!(before.elements().len(), 2);

    // New reasons, same identities, reversed order.
    let second = universe
        .put_and_wait("rename", move |tx| tx.set(n, tags, texts(&["B", "A"])))
        .unwrap();
    assert_eq!(value(&universe, &second, n, items), before);
    let labels: Vec<Value> = before
        .objects()
        .into_iter()
        .map(|o| value(&universe, &second, o, label))
        .collect();
    assert_eq!(labels, vec![Value::from("a"), Value::from("b")]);
    assert_eq!(second.object_count(), first.object_count());
}

#[test]
fn test_colliding_identities_collapse_to_one_item() {
    let m = catalog(true);
    let (children, tags, items, node) = (m.children, m.tags, m.items, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let n = universe.new_object(node, "n");
    let first = universe
        .put_and_wait("add", move |tx| {
            tx.add(ObjectId::UNIVERSE, children, n.into())?;
            tx.set(n, tags, texts(&["a"]))
        })
        .unwrap();
    let before = value(&universe, &first, n, items);
    assert_eq!(before.elements().len(), 1);

    let second = universe
        .put_and_wait("duplicate", move |tx| tx.set(n, tags, texts(&["a", "A"])))
        .unwrap();
    assert_eq!(value(&universe, &second, n, items), before);
}

#[test]
fn test_replaced_object_reads_through_to_survivor() {
    let m = catalog(false);
    let (children, tags, items, note, node) = (m.children, m.tags, m.items, m.note, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let n = universe.new_object(node, "n");
    let first = universe
        .put_and_wait("add", move |tx| {
            tx.add(ObjectId::UNIVERSE, children, n.into())?;
            tx.set(n, tags, texts(&["a"]))
        })
        .unwrap();
    let survivor = value(&universe, &first, n, items).objects()[0];
    universe
        .put_and_wait("annotate", move |tx| tx.set(survivor, note, "first".into()))
        .unwrap();
    m.notes.lock().clear();

    // "A" derives a fresh item that is matched away; reading its note
    // lands on the survivor.
    let state = universe
        .put_and_wait("rename", move |tx| tx.set(n, tags, texts(&["A"])))
        .unwrap();
    assert_eq!(*m.notes.lock(), vec![vec![Value::from("first")]]);
    assert_eq!(value(&universe, &state, n, items), Value::list([Value::Object(survivor)]));
}

#[test]
fn test_readded_item_reuses_its_detached_object() {
    let m = tree();
    let (children, tags, items, label, node) = (m.children, m.tags, m.items, m.label, m.node);
    let universe = UniverseTransaction::start(m.registry, sequential()).unwrap();
    let n = universe.new_object(node, "n");
    let first = universe
        .put_and_wait("add", move |tx| {
            tx.add(ObjectId::UNIVERSE, children, n.into())?;
            tx.set(n, tags, texts(&["a", "b"]))
        })
        .unwrap();
    let original = value(&universe, &first, n, items);
    let b = original.objects()[1];

    let dropped = universe
        .put_and_wait("drop b", move |tx| tx.set(n, tags, texts(&["a"])))
        .unwrap();
    assert!(!dropped.has_object(b));

    let readded = universe
        .put_and_wait("readd b", move |tx| tx.set(n, tags, texts(&["a", "b"])))
        .unwrap();
    assert_eq!(value(&universe, &readded, n, items), original);
    assert_eq!(value(&universe, &readded, b, label), Value::from("b"));
}

// ============================================================================
// Limits and orphan state
// ============================================================================

#[test]
fn test_too_many_observed_is_reported() {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let props: Vec<PropertyId> = ["p", "q", "r"]
        .into_iter()
        .map(|name| b.property(PropertySpec::observed(name).with_default(0)))
        .collect();
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties(props.clone()));
    b.observer(
        node,
        ObserverSpec::new("read all", move |tx| {
            let t = tx.target();
            for p in &props {
                tx.get(t, *p)?;
            }
            Ok(())
        }),
    )
    .unwrap();
    let config = sequential().with_max_nr_of_observed(2);
    let universe = UniverseTransaction::start(b.build().unwrap(), config).unwrap();
    let a = universe.new_object(node, "a");

    let result = universe.put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()));
    match result {
        Err(EngineError::TooManyObserved { count, limit, .. }) => {
            assert_eq!(count, 3);
            assert_eq!(limit, 2);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(universe.is_killed());
}

#[test]
fn test_too_many_observers_is_reported() {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let level = b.property(PropertySpec::observed("level").with_default(0));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([level]));
    for name in ["first", "second", "third"] {
        b.observer(
            node,
            ObserverSpec::new(name, move |tx| {
                let t = tx.target();
                tx.get(t, level).map(|_| ())
            }),
        )
        .unwrap();
    }
    let config = sequential().with_max_nr_of_observers(2);
    let universe = UniverseTransaction::start(b.build().unwrap(), config).unwrap();
    let a = universe.new_object(node, "a");

    let result = universe.put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()));
    match result {
        Err(EngineError::TooManyObservers { object, count, limit, .. }) => {
            assert_eq!(object, a);
            assert_eq!(count, 3);
            assert_eq!(limit, 2);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

/// A node whose observer keeps stamping an object nobody contains.
fn stamp_model(config: EngineConfig) -> (UniverseTransaction, PropertyId, ObjectId, ObjectId) {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let note = b.property(PropertySpec::observed("note"));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([note]));
    let loose_slot = Arc::new(Mutex::new(ObjectId::UNIVERSE));
    let loose_ref = loose_slot.clone();
    b.observer(
        node,
        ObserverSpec::new("stamp", move |tx| {
            let loose = *loose_ref.lock();
            if tx.get(loose, note)? != Value::from("stamped") {
                tx.set(loose, note, "stamped".into())?;
            }
            Ok(())
        }),
    )
    .unwrap();
    let universe = UniverseTransaction::start(b.build().unwrap(), config).unwrap();
    let a = universe.new_object(node, "a");
    let loose = universe.new_object(node, "loose");
    *loose_slot.lock() = loose;
    (universe, children, a, loose)
}

#[test]
fn test_state_left_on_unreachable_object_kills() {
    let (universe, children, a, _) = stamp_model(sequential());

    let result = universe.put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()));
    match result {
        Err(EngineError::OrphanState { properties, .. }) => assert_eq!(properties, "note"),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(universe.is_killed());
}

#[test]
fn test_orphan_state_check_can_be_disabled() {
    let (universe, children, a, loose) = stamp_model(sequential().with_check_orphan_state(false));

    let state = universe
        .put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()))
        .unwrap();
    assert!(state.is_active(a));
    assert!(!state.is_rooted(loose));
}

// ============================================================================
// Imperative queueing
// ============================================================================

#[test]
fn test_inline_imperative_write_does_not_wait_for_a_full_queue() {
    let mut b = RegistryBuilder::new();
    let children = b.property(PropertySpec::observed("children").containment());
    let flag = b.property(PropertySpec::observed("flag").with_default(false));
    let mirror = b.property(PropertySpec::observed("mirror").with_default(false));
    b.attach(ClassId::UNIVERSE, [children]).unwrap();
    let node = b.class(ClassSpec::new("Node").with_properties([flag, mirror]));
    let config = sequential().with_max_in_queue(1);
    let universe = UniverseTransaction::start(b.build().unwrap(), config).unwrap();
    let a = universe.new_object(node, "a");
    universe
        .put_and_wait("add", move |tx| tx.add(ObjectId::UNIVERSE, children, a.into()))
        .unwrap();

    // Runs on the universe thread and writes back from there.
    universe.add_imperative(
        "mirror",
        move |tx: &ImperativeTransaction, delta: &Delta<'_>| {
            let flipped = delta
                .changes()
                .any(|c| c.object == a && c.property == flag && c.new == Some(Value::Bool(true)));
            if flipped {
                tx.set(a, mirror, true).unwrap();
            }
        },
        Arc::new(InlineScheduler),
        false,
    );
    universe.wait_for_idle();

    let released = Arc::new(AtomicBool::new(false));
    let gate = released.clone();
    universe
        .put("flip", move |tx| {
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            tx.set(a, flag, true.into())
        })
        .unwrap();
    // Occupies the only queue slot while "flip" runs.
    universe.put("filler", |_| Ok(())).unwrap();
    released.store(true, Ordering::SeqCst);

    let settled = universe.status_provider().wait_for_timeout(
        |s| s.is_idle() && s.state.value(a, mirror) == Some(&Value::Bool(true)),
        Duration::from_secs(10),
    );
    assert!(settled.is_some());
    assert_eq!(universe.status().queued, 0);
}
