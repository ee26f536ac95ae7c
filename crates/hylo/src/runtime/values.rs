use crate::engine::DeviceBuffer;
use crate::graph::{Graph, Node, ValueId};

/// Where a live value currently resides.
#[derive(Clone)]
pub(crate) enum Slot<T> {
    Host(T),
    Device(DeviceBuffer),
    /// Output `index` of outstanding engine work `group`.
    Pending { group: usize, index: usize },
}

/// Dense per-run value table indexed by value id.
pub(crate) struct DenseValueStore<T> {
    entries: Vec<Option<Slot<T>>>,
}

impl<T: Clone> DenseValueStore<T> {
    pub(crate) fn new(graph: &Graph) -> Self {
        let size = graph.next_value_id().0 as usize;
        Self {
            entries: vec![None; size],
        }
    }

    pub(crate) fn get(&self, value: ValueId) -> Option<&Slot<T>> {
        self.entries
            .get(value.0 as usize)
            .and_then(|entry| entry.as_ref())
    }

    pub(crate) fn insert(&mut self, value: ValueId, slot: Slot<T>) {
        let index = value.0 as usize;
        if index >= self.entries.len() {
            self.entries.resize(index + 1, None);
        }
        self.entries[index] = Some(slot);
    }

    pub(crate) fn release(&mut self, value: ValueId) {
        if let Some(entry) = self.entries.get_mut(value.0 as usize) {
            *entry = None;
        }
    }

    /// Values waiting on `group`.
    pub(crate) fn pending_in(&self, group: usize) -> Vec<(ValueId, usize)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(value, entry)| match entry {
                Some(Slot::Pending { group: g, index }) if *g == group => {
                    Some((ValueId(value as u32), *index))
                }
                _ => None,
            })
            .collect()
    }
}

/// Position of the last node that reads each value; graph outputs never expire.
pub(crate) fn compute_last_use(graph: &Graph) -> Vec<Option<usize>> {
    let size = graph.next_value_id().0 as usize;
    let mut last_use = vec![None; size];
    for (position, node) in graph.nodes.iter().enumerate() {
        for value in &node.inputs {
            if let Some(entry) = last_use.get_mut(value.0 as usize) {
                *entry = Some(position);
            }
        }
    }
    for value in &graph.outputs {
        if let Some(entry) = last_use.get_mut(value.0 as usize) {
            *entry = Some(usize::MAX);
        }
    }
    last_use
}

pub(crate) fn first_missing_operand<T: Clone>(node: &Node, values: &DenseValueStore<T>) -> Option<ValueId> {
    node.inputs
        .iter()
        .copied()
        .find(|value| values.get(*value).is_none())
}
