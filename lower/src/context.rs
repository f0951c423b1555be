//! State owned by one lowering run.

use std::collections::{HashMap, HashSet};

use fusor_ir::{ComputeAtMap, Fusion, IdRef, TvRef, Val};

use crate::circular_buffer::CircularBufferInfo;
use crate::error::*;
use crate::kir::NodeId;

/// Tells the allocation pass which tensors must be filled with an identity
/// value because a predicated read could observe elements no thread wrote.
pub trait PredicateElimination {
    fn init_value(&self, tv: TvRef) -> Option<Val>;
}

/// [`PredicateElimination`] backed by an explicit table.
#[derive(Debug, Clone, Default)]
pub struct MapPredicateElimination {
    init_values: HashMap<TvRef, Val>,
}

impl MapPredicateElimination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_init_value(mut self, tv: TvRef, value: Val) -> Self {
        self.init_values.insert(tv, value);
        self
    }
}

impl PredicateElimination for MapPredicateElimination {
    fn init_value(&self, tv: TvRef) -> Option<Val> {
        self.init_values.get(&tv).cloned()
    }
}

/// Loop axes replaced by a promoted axis after loop promotion; identity by default.
#[derive(Debug, Clone, Default)]
pub struct LoopPromotion {
    promoted: HashMap<IdRef, IdRef>,
}

impl LoopPromotion {
    pub fn insert(&mut self, id: IdRef, promoted: IdRef) {
        self.promoted.insert(id, promoted);
    }

    pub fn promoted(&self, id: IdRef) -> IdRef {
        self.promoted.get(&id).copied().unwrap_or(id)
    }
}

/// Allocation-domain axes backing a local allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationDomainInfo {
    pub ids: Vec<IdRef>,
}

/// Everything a lowering run reads and records, passed explicitly to each pass.
///
/// One context is created per lowering invocation and dropped with it.
pub struct LoweringContext {
    fusion: Fusion,
    ca_map: ComputeAtMap,
    predicate_elimination: Box<dyn PredicateElimination>,
    pub circular_buffer_info: CircularBufferInfo,
    pub loop_promotion: LoopPromotion,
    local_allocation_info: HashMap<NodeId, AllocationDomainInfo>,
    /// Bulk-copy expression to its mbarrier tensor.
    pub ldst_mbarrier_map: HashMap<NodeId, TvRef>,
    /// Bulk-copy expression, or mbarrier init/inval node, to its token tensor.
    pub ldst_mbarrier_token_map: HashMap<NodeId, TvRef>,
    /// Allocations of mbarriers and tokens, whose lifetimes alias analysis must respect.
    pub mbarrier_token_smem_alloc_set: HashSet<NodeId>,
    next_node: u32,
}

impl LoweringContext {
    pub fn new(fusion: Fusion) -> Self {
        let ca_map = ComputeAtMap::build(&fusion);
        Self {
            fusion,
            ca_map,
            predicate_elimination: Box::new(MapPredicateElimination::new()),
            circular_buffer_info: CircularBufferInfo::default(),
            loop_promotion: LoopPromotion::default(),
            local_allocation_info: HashMap::new(),
            ldst_mbarrier_map: HashMap::new(),
            ldst_mbarrier_token_map: HashMap::new(),
            mbarrier_token_smem_alloc_set: HashSet::new(),
            next_node: 0,
        }
    }

    pub fn with_predicate_elimination(mut self, analysis: impl PredicateElimination + 'static) -> Self {
        self.predicate_elimination = Box::new(analysis);
        self
    }

    pub fn fusion(&self) -> &Fusion {
        &self.fusion
    }

    /// Mutable access for passes that create helper tensors; the axis map is
    /// not rebuilt, so new tensors must not take part in loop mapping.
    pub fn fusion_mut(&mut self) -> &mut Fusion {
        &mut self.fusion
    }

    pub fn ca_map(&self) -> &ComputeAtMap {
        &self.ca_map
    }

    pub fn predicate_elimination(&self) -> &dyn PredicateElimination {
        self.predicate_elimination.as_ref()
    }

    pub fn next_node_id(&mut self) -> NodeId {
        self.next_node += 1;
        NodeId(self.next_node - 1)
    }

    pub fn register_allocation_info(&mut self, alloc: NodeId, info: AllocationDomainInfo) -> Result<()> {
        if self.local_allocation_info.contains_key(&alloc) {
            return DuplicateAllocationInfoSnafu { node: alloc }.fail();
        }
        self.local_allocation_info.insert(alloc, info);
        Ok(())
    }

    pub fn allocation_info(&self, alloc: NodeId) -> Option<&AllocationDomainInfo> {
        self.local_allocation_info.get(&alloc)
    }

    pub fn allocation_infos(&self) -> &HashMap<NodeId, AllocationDomainInfo> {
        &self.local_allocation_info
    }
}

impl std::fmt::Debug for LoweringContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoweringContext")
            .field("allocations", &self.local_allocation_info.len())
            .field("mbarriers", &self.ldst_mbarrier_map.len())
            .finish_non_exhaustive()
    }
}
