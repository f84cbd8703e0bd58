//! Demo universes driven by `cascade run`.

use std::sync::Arc;

use anyhow::{Context, Result};
use cascade_engine::{
    ClassId, ClassSpec, Delta, EngineConfig, ImperativeTransaction, NewableSpec, ObjectId,
    ObserverSpec, PropertySpec, Reason, Registry, RegistryBuilder, Scheduler,
    UniverseTransaction, Value,
};
use clap::ValueEnum;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Each node's `x` follows the previous node's `y`, and `y = x + 1`.
    Chain,
    /// An observer that negates its own output; never settles.
    Toggle,
    /// Derived child objects, one per tag, watched by an imperative.
    Tree,
}

/// What a finished scenario left behind.
#[derive(Debug)]
pub struct Outcome {
    pub json: serde_json::Value,
    pub actions: u64,
    pub objects: usize,
}

/// Build the scenario's universe, drive it and stop it.
///
/// `scheduler` runs the imperative of scenarios that have one.
pub fn run(scenario: Scenario, size: usize, config: &EngineConfig, scheduler: Arc<dyn Scheduler>) -> Result<Outcome> {
    info!(scenario = ?scenario, size, "scenario_start");
    let universe = match scenario {
        Scenario::Chain => chain(size, config)?,
        Scenario::Toggle => toggle(config)?,
        Scenario::Tree => tree(size, config, scheduler)?,
    };
    universe.stop();
    let state = universe
        .wait_for_end()
        .with_context(|| format!("scenario {scenario:?} did not settle"))?;
    Ok(Outcome {
        json: universe.to_json(ObjectId::UNIVERSE),
        actions: universe.stats().actions,
        objects: state.object_count(),
    })
}

fn chain(size: usize, config: &EngineConfig) -> Result<UniverseTransaction> {
    let mut b = RegistryBuilder::new();
    let nodes = b.property(PropertySpec::observed("nodes").containment());
    let prev = b.property(PropertySpec::observed("prev"));
    let x = b.property(PropertySpec::observed("x").with_default(0));
    let y = b.property(PropertySpec::observed("y").with_default(0));
    b.attach(ClassId::UNIVERSE, [nodes])?;
    let node = b.class(ClassSpec::new("Node").with_properties([prev, x, y]));
    b.observer(
        node,
        ObserverSpec::new("x = prev.y", move |tx| {
            let t = tx.target();
            if let Some(p) = tx.get_object(t, prev)? {
                let v = tx.get(p, y)?;
                tx.set(t, x, v)?;
            }
            Ok(())
        })
        .deriving([x]),
    )?;
    b.observer(
        node,
        ObserverSpec::new("y = x + 1", move |tx| {
            let t = tx.target();
            let v = tx.get_int(t, x)?.unwrap_or(0);
            tx.set(t, y, Value::Int(v + 1))
        })
        .deriving([y]),
    )?;
    let universe = UniverseTransaction::start(b.build()?, config.clone())?;

    let ids: Vec<ObjectId> = (0..size.max(1))
        .map(|i| universe.new_object(node, &format!("n{i}")))
        .collect();
    let linked = ids.clone();
    universe.put_and_wait("link", move |tx| {
        for pair in linked.windows(2) {
            tx.set(pair[1], prev, pair[0].into())?;
        }
        tx.set(ObjectId::UNIVERSE, nodes, Value::list(linked.iter().copied().map(Value::from)))
    })?;
    let first = ids[0];
    universe.put_and_wait("start", move |tx| tx.set(first, x, Value::Int(1)))?;
    Ok(universe)
}

fn toggle(config: &EngineConfig) -> Result<UniverseTransaction> {
    let mut b = RegistryBuilder::new();
    let switches = b.property(PropertySpec::observed("switches").containment());
    let on = b.property(PropertySpec::observed("on").with_default(false));
    b.attach(ClassId::UNIVERSE, [switches])?;
    let switch = b.class(ClassSpec::new("Switch").with_properties([on]));
    b.observer(
        switch,
        ObserverSpec::new("flip", move |tx| {
            let t = tx.target();
            let current = tx.get_bool(t, on)?;
            tx.set(t, on, (!current).into())
        }),
    )?;
    let universe = UniverseTransaction::start(b.build()?, config.clone())?;
    let s = universe.new_object(switch, "switch");
    // The error surfaces again from wait_for_end.
    if let Err(e) = universe.put_and_wait("install", move |tx| tx.add(ObjectId::UNIVERSE, switches, s.into())) {
        info!(error = %e, "scenario_failed");
    }
    Ok(universe)
}

struct TreeModel {
    registry: Registry,
    roots: cascade_engine::PropertyId,
    tags: cascade_engine::PropertyId,
    node: ClassId,
}

fn tree_model() -> Result<TreeModel> {
    let mut b = RegistryBuilder::new();
    let roots = b.property(PropertySpec::observed("roots").containment());
    let tags = b.property(PropertySpec::observed("tags"));
    let leaves = b.property(PropertySpec::observed("leaves").containment());
    let label = b.property(PropertySpec::setable("label"));
    b.attach(ClassId::UNIVERSE, [roots])?;
    let node = b.class(ClassSpec::new("Node").with_properties([tags, leaves]));
    let leaf = b.class(
        ClassSpec::new("Leaf")
            .with_properties([label])
            .newable(NewableSpec::new("Leaf").with_identity(move |tx, o| tx.get(o, label))),
    );
    b.observer(
        node,
        ObserverSpec::new("leaves from tags", move |tx| {
            let t = tx.target();
            let mut derived = Vec::new();
            for tag in tx.get(t, tags)?.elements() {
                let child = tx.construct(Reason::new(t, "tag", [tag.clone()]), leaf)?;
                tx.set(child, label, tag)?;
                derived.push(Value::Object(child));
            }
            tx.set(t, leaves, Value::list(derived))
        })
        .deriving([leaves]),
    )?;
    Ok(TreeModel {
        registry: b.build()?,
        roots,
        tags,
        node,
    })
}

fn tree(size: usize, config: &EngineConfig, scheduler: Arc<dyn Scheduler>) -> Result<UniverseTransaction> {
    let model = tree_model()?;
    let (roots, tags, node) = (model.roots, model.tags, model.node);
    let universe = UniverseTransaction::start(model.registry, config.clone())?;
    universe.add_imperative(
        "printer",
        |_: &ImperativeTransaction, delta: &Delta<'_>| {
            for change in delta.changes() {
                info!(object = %change.object, property = %change.property, new = ?change.new, "delta");
            }
        },
        scheduler,
        false,
    );

    let root = universe.new_object(node, "root");
    universe.put_and_wait("plant", move |tx| tx.add(ObjectId::UNIVERSE, roots, root.into()))?;
    let labels: Vec<Value> = (0..size).map(|i| Value::from(format!("leaf-{i}"))).collect();
    universe.put_and_wait("grow", move |tx| tx.set(root, tags, Value::list(labels.clone())))?;
    universe.put_and_wait("prune", move |tx| {
        let remaining = tx.get(root, tags)?.elements().into_iter().skip(1);
        tx.set(root, tags, Value::list(remaining))
    })?;
    Ok(universe)
}
