use std::collections::HashMap;

use fixedbitset::FixedBitSet;

use crate::backend::computation::Computation;
use crate::backend::spec::InstId;

/// Transitive dependency index of one computation over operand and control edges.
///
/// Built from scratch; the only incremental update supported is
/// [`ReachabilityMap::add_control_edge`]. Any other mutation of the computation
/// invalidates the map.
#[derive(Debug, Clone)]
pub struct ReachabilityMap {
    index_of: HashMap<InstId, usize>,
    /// `ancestors[i]` holds every instruction that reaches `i`, including `i` itself.
    ancestors: Vec<FixedBitSet>,
}

impl ReachabilityMap {
    pub fn build(comp: &Computation) -> Self {
        let order = comp.post_order();
        let index_of: HashMap<InstId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut ancestors: Vec<FixedBitSet> = Vec::with_capacity(order.len());
        for (i, id) in order.iter().enumerate() {
            let mut bits = FixedBitSet::with_capacity(order.len());
            bits.insert(i);
            let inst = &comp[*id];
            for dep in inst
                .operands()
                .iter()
                .chain(inst.control_predecessors().iter())
            {
                if let Some(&d) = index_of.get(dep) {
                    bits.union_with(&ancestors[d]);
                }
            }
            ancestors.push(bits);
        }
        Self {
            index_of,
            ancestors,
        }
    }

    /// True when `to` (transitively) depends on `from`. Every instruction reaches itself.
    pub fn is_reachable(&self, from: InstId, to: InstId) -> bool {
        match (self.index_of.get(&from), self.index_of.get(&to)) {
            (Some(&f), Some(&t)) => self.ancestors[t].contains(f),
            _ => false,
        }
    }

    pub fn is_connected(&self, a: InstId, b: InstId) -> bool {
        self.is_reachable(a, b) || self.is_reachable(b, a)
    }

    /// Records a new control edge `from -> to` and propagates it to everything downstream of `to`.
    pub fn add_control_edge(&mut self, from: InstId, to: InstId) {
        let (Some(&f), Some(&t)) = (self.index_of.get(&from), self.index_of.get(&to)) else {
            return;
        };
        let incoming = self.ancestors[f].clone();
        for bits in self.ancestors.iter_mut() {
            if bits.contains(t) {
                bits.union_with(&incoming);
            }
        }
    }
}
