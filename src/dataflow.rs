//! Logical plans.
//!
//! A [`LogicalPlan`] is what the user builds: named operators, each
//! with a factory and its own operator-scoped attributes, connected by
//! named streams. [`LogicalPlan::validate`] checks it and derives the
//! [`Topology`] the runtime needs. [`LogicalPlan::assign_units`]
//! groups operators into execution units.
//!
//! An **execution unit** is a group of operators deployed, and
//! restarted, together. Both ends of an inline stream always share a
//! unit. The application attribute `containers_max_count` caps how
//! many units there are.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::attributes::defaults;
use crate::attributes::AttributeStore;
use crate::attributes::KeyRegistry;
use crate::attributes::StandardKeys;
use crate::errors::ConfigError;
use crate::operators::Operator;
use crate::operators::OperatorFactory;
use crate::recovery::OperatorId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct OperatorMeta {
    id: OperatorId,
    factory: OperatorFactory,
    attributes: Arc<AttributeStore>,
}

impl OperatorMeta {
    pub fn id(&self) -> &OperatorId {
        &self.id
    }

    /// Operator-scoped attributes.
    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    pub(crate) fn attributes_arc(&self) -> Arc<AttributeStore> {
        self.attributes.clone()
    }

    pub(crate) fn build(&self) -> Box<dyn Operator> {
        (self.factory)()
    }
}

impl fmt::Debug for OperatorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorMeta")
            .field("id", &self.id)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct StreamMeta {
    id: StreamId,
    source: OperatorId,
    sinks: Vec<OperatorId>,
    inline: bool,
}

impl StreamMeta {
    /// Require both ends to be deployed in the same unit.
    pub fn set_inline(&mut self, inline: bool) -> &mut Self {
        self.inline = inline;
        self
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn source(&self) -> &OperatorId {
        &self.source
    }

    pub fn sinks(&self) -> &[OperatorId] {
        &self.sinks
    }

    pub fn is_inline(&self) -> bool {
        self.inline
    }
}

pub struct LogicalPlan {
    registry: Arc<KeyRegistry>,
    keys: StandardKeys,
    attributes: Arc<AttributeStore>,
    operators: Vec<OperatorMeta>,
    streams: Vec<StreamMeta>,
}

impl LogicalPlan {
    /// Empty plan with its own key registry holding the
    /// [`StandardKeys`].
    pub fn new() -> Result<Self, ConfigError> {
        let registry = Arc::new(KeyRegistry::new());
        let keys = StandardKeys::register(&registry)?;
        Ok(Self::with_registry(registry, keys))
    }

    /// Empty plan sharing a registry that already holds the standard
    /// keys, e.g. because the caller registered its own keys too.
    pub fn with_registry(registry: Arc<KeyRegistry>, keys: StandardKeys) -> Self {
        Self {
            attributes: Arc::new(AttributeStore::new(registry.clone())),
            registry,
            keys,
            operators: Vec::new(),
            streams: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub fn keys(&self) -> &StandardKeys {
        &self.keys
    }

    /// Application-scoped attributes.
    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    pub(crate) fn attributes_arc(&self) -> Arc<AttributeStore> {
        self.attributes.clone()
    }

    #[track_caller]
    pub fn add_operator<F, O>(&mut self, name: &str, factory: F) -> Result<&OperatorMeta, ConfigError>
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: Operator + 'static,
    {
        if self.operator(name).is_some() {
            return Err(ConfigError::invalid_plan(format!(
                "duplicate operator name `{name}`"
            )));
        }
        let factory: OperatorFactory = Arc::new(move || Box::new(factory()) as Box<dyn Operator>);
        self.operators.push(OperatorMeta {
            id: OperatorId::new(name),
            factory,
            attributes: Arc::new(AttributeStore::new(self.registry.clone())),
        });
        let meta = &self.operators[self.operators.len() - 1];
        Ok(meta)
    }

    pub fn operator(&self, name: &str) -> Option<&OperatorMeta> {
        self.operators.iter().find(|op| op.id.as_str() == name)
    }

    pub fn operators(&self) -> &[OperatorMeta] {
        &self.operators
    }

    pub fn streams(&self) -> &[StreamMeta] {
        &self.streams
    }

    /// Connect the single output of `from` to an input of each of
    /// `to`.
    #[track_caller]
    pub fn add_stream(
        &mut self,
        name: &str,
        from: &str,
        to: &[&str],
    ) -> Result<&mut StreamMeta, ConfigError> {
        if self.streams.iter().any(|s| s.id.0 == name) {
            return Err(ConfigError::invalid_plan(format!(
                "duplicate stream name `{name}`"
            )));
        }
        if to.is_empty() {
            return Err(ConfigError::invalid_plan(format!(
                "stream `{name}` has no sinks"
            )));
        }
        let mut sinks = Vec::with_capacity(to.len());
        for op in std::iter::once(&from).chain(to) {
            if self.operator(op).is_none() {
                return Err(ConfigError::invalid_plan(format!(
                    "stream `{name}` references unknown operator `{op}`"
                )));
            }
        }
        for sink in to {
            let sink = OperatorId::new(*sink);
            if sinks.contains(&sink) {
                return Err(ConfigError::invalid_plan(format!(
                    "stream `{name}` lists sink `{sink}` twice"
                )));
            }
            sinks.push(sink);
        }
        if self.streams.iter().any(|s| s.source.as_str() == from) {
            return Err(ConfigError::invalid_plan(format!(
                "operator `{from}` already has an output stream"
            )));
        }
        self.streams.push(StreamMeta {
            id: StreamId(name.to_owned()),
            source: OperatorId::new(from),
            sinks,
            inline: false,
        });
        let idx = self.streams.len() - 1;
        Ok(&mut self.streams[idx])
    }

    /// Check the plan and derive its topology.
    #[track_caller]
    pub fn validate(&self) -> Result<Topology, ConfigError> {
        if self.operators.is_empty() {
            return Err(ConfigError::invalid_plan("plan has no operators"));
        }
        let mut topo = Topology::default();
        for op in &self.operators {
            topo.inputs.insert(op.id.clone(), Vec::new());
        }
        for stream in &self.streams {
            topo.outputs.insert(stream.source.clone(), stream.id.clone());
            topo.consumers.insert(stream.id.clone(), stream.sinks.clone());
            for sink in &stream.sinks {
                topo.inputs
                    .entry(sink.clone())
                    .or_default()
                    .push(stream.id.clone());
            }
        }

        // Kahn's algorithm, seeded in plan order so the result is
        // deterministic.
        let mut in_degree: HashMap<&OperatorId, usize> = self
            .operators
            .iter()
            .map(|op| (&op.id, topo.inputs(&op.id).len()))
            .collect();
        let mut ready: VecDeque<&OperatorId> = self
            .operators
            .iter()
            .map(|op| &op.id)
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.operators.len());
        while let Some(op) = ready.pop_front() {
            order.push(op.clone());
            for sink in topo.direct_downstream(op) {
                if let Some(degree) = in_degree.get_mut(sink) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(sink);
                    }
                }
            }
        }
        if order.len() != self.operators.len() {
            return Err(ConfigError::invalid_plan("plan contains a cycle"));
        }

        // Reverse topological order so every downstream set is
        // complete before its upstreams need it.
        let mut downstream: HashMap<OperatorId, BTreeSet<OperatorId>> = HashMap::new();
        for op in order.iter().rev() {
            let mut reachable = BTreeSet::new();
            for sink in topo.direct_downstream(op) {
                reachable.insert(sink.clone());
                if let Some(further) = downstream.get(sink) {
                    reachable.extend(further.iter().cloned());
                }
            }
            downstream.insert(op.clone(), reachable);
        }
        topo.order = order;
        topo.downstream = downstream;
        Ok(topo)
    }

    /// Group operators into execution units.
    #[track_caller]
    pub fn assign_units(&self) -> Result<Vec<Unit>, ConfigError> {
        let topo = self.validate()?;
        let max = self
            .attributes
            .attr_value(&self.keys.containers_max_count, defaults::CONTAINERS_MAX_COUNT);
        if max == 0 {
            return Err(ConfigError::invalid_value(
                self.keys.containers_max_count.name(),
                "must be at least 1",
            ));
        }

        // Union-find over inline streams.
        let index: HashMap<&OperatorId, usize> = topo
            .order
            .iter()
            .enumerate()
            .map(|(i, op)| (op, i))
            .collect();
        let mut parent: Vec<usize> = (0..topo.order.len()).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }
        for stream in self.streams.iter().filter(|s| s.inline) {
            let a = find(&mut parent, index[&stream.source]);
            for sink in &stream.sinks {
                let b = find(&mut parent, index[sink]);
                // Lower index wins so roots follow topological order.
                parent[a.max(b)] = a.min(b);
            }
        }

        let mut units: Vec<Unit> = Vec::new();
        let mut unit_of_root = HashMap::new();
        for (i, op) in topo.order.iter().enumerate() {
            let root = find(&mut parent, i);
            let unit = *unit_of_root.entry(root).or_insert_with(|| {
                units.push(Unit {
                    index: units.len(),
                    operators: Vec::new(),
                });
                units.len() - 1
            });
            units[unit].operators.push(op.clone());
        }

        let max = max as usize;
        if units.len() > max {
            tracing::debug!("Packing {} units into {max}", units.len());
            let mut packed: Vec<Unit> = (0..max)
                .map(|index| Unit {
                    index,
                    operators: Vec::new(),
                })
                .collect();
            for (i, unit) in units.into_iter().enumerate() {
                packed[i % max].operators.extend(unit.operators);
            }
            units = packed;
        }
        Ok(units)
    }
}

impl fmt::Debug for LogicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalPlan")
            .field("attributes", &self.attributes)
            .field("operators", &self.operators)
            .field("streams", &self.streams)
            .finish()
    }
}

/// Operators deployed and restarted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub index: usize,
    pub operators: Vec<OperatorId>,
}

/// Connectivity of a validated plan.
#[derive(Debug, Default, Clone)]
pub struct Topology {
    order: Vec<OperatorId>,
    /// Input streams of each operator, in port order.
    inputs: HashMap<OperatorId, Vec<StreamId>>,
    outputs: HashMap<OperatorId, StreamId>,
    consumers: HashMap<StreamId, Vec<OperatorId>>,
    /// Every operator reachable downstream, transitively.
    downstream: HashMap<OperatorId, BTreeSet<OperatorId>>,
}

impl Topology {
    /// Operators in topological order.
    pub fn order(&self) -> &[OperatorId] {
        &self.order
    }

    pub fn inputs(&self, op: &OperatorId) -> &[StreamId] {
        self.inputs.get(op).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn output(&self, op: &OperatorId) -> Option<&StreamId> {
        self.outputs.get(op)
    }

    pub fn consumers(&self, stream: &StreamId) -> &[OperatorId] {
        self.consumers
            .get(stream)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_source(&self, op: &OperatorId) -> bool {
        self.inputs(op).is_empty()
    }

    pub fn reachable_downstream(&self, op: &OperatorId) -> impl Iterator<Item = &OperatorId> {
        self.downstream.get(op).into_iter().flatten()
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamId> {
        self.consumers.keys()
    }

    /// Operators consuming `op`'s output stream.
    pub(crate) fn direct_downstream<'a>(
        &'a self,
        op: &OperatorId,
    ) -> impl Iterator<Item = &'a OperatorId> + 'a {
        self.outputs
            .get(op)
            .into_iter()
            .flat_map(|stream| self.consumers(stream))
    }
}

#[cfg(test)]
struct Nop;

#[cfg(test)]
impl Operator for Nop {}

#[cfg(test)]
fn diamond() -> LogicalPlan {
    let mut plan = LogicalPlan::new().unwrap();
    for name in ["src", "left", "right", "join"] {
        plan.add_operator(name, || Nop).unwrap();
    }
    plan.add_stream("split", "src", &["left", "right"]).unwrap();
    plan.add_stream("l", "left", &["join"]).unwrap();
    plan.add_stream("r", "right", &["join"]).unwrap();
    plan
}

#[test]
fn topology_orders_and_reaches() {
    let topo = diamond().validate().unwrap();
    let ids: Vec<_> = topo.order().iter().map(|op| op.as_str()).collect();
    assert_eq!(ids, vec!["src", "left", "right", "join"]);

    let src = OperatorId::new("src");
    let reach: Vec<_> = topo.reachable_downstream(&src).map(|op| op.as_str()).collect();
    assert_eq!(reach, vec!["join", "left", "right"]);
    assert!(topo.is_source(&src));
    assert_eq!(topo.inputs(&OperatorId::new("join")).len(), 2);
    assert_eq!(topo.reachable_downstream(&OperatorId::new("join")).count(), 0);
}

#[test]
fn cycles_are_rejected() {
    let mut plan = LogicalPlan::new().unwrap();
    plan.add_operator("a", || Nop).unwrap();
    plan.add_operator("b", || Nop).unwrap();
    plan.add_stream("ab", "a", &["b"]).unwrap();
    plan.add_stream("ba", "b", &["a"]).unwrap();
    let err = plan.validate().unwrap_err();
    assert!(err.to_string().contains("cycle"), "{err}");
}

#[test]
fn bad_streams_are_rejected() {
    let mut plan = LogicalPlan::new().unwrap();
    plan.add_operator("a", || Nop).unwrap();
    plan.add_operator("b", || Nop).unwrap();
    assert!(plan.add_operator("a", || Nop).is_err());
    assert!(plan.add_stream("s", "a", &["missing"]).is_err());
    assert!(plan.add_stream("s", "a", &[]).is_err());
    plan.add_stream("s", "a", &["b"]).unwrap();
    assert!(plan.add_stream("t", "a", &["b"]).is_err());
}

#[test]
fn inline_streams_share_a_unit() {
    let mut plan = diamond();
    plan.streams
        .iter_mut()
        .find(|s| s.id.0 == "l")
        .unwrap()
        .set_inline(true);
    let units = plan.assign_units().unwrap();
    let ops: Vec<Vec<&str>> = units
        .iter()
        .map(|u| u.operators.iter().map(|op| op.as_str()).collect())
        .collect();
    assert_eq!(ops, vec![vec!["src"], vec!["left", "join"], vec!["right"]]);
}

#[test]
fn max_count_packs_units() {
    let plan = diamond();
    let slot = plan.attributes().attr(&plan.keys().containers_max_count).unwrap();
    slot.set(1);
    let units = plan.assign_units().unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].operators.len(), 4);

    slot.set(0);
    assert!(matches!(
        plan.assign_units(),
        Err(ConfigError::InvalidValue { .. })
    ));
}
