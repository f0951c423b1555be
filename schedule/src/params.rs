//! Heuristic parameters produced by the schedulers.

use std::collections::BTreeMap;
use std::fmt;

use fusor_dtype::IndexType;
use fusor_ir::ParallelType;

use crate::heuristic::ScheduleHeuristic;

/// Extents bound to grid and block dimensions at launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchParams {
    extents: BTreeMap<ParallelType, i64>,
}

impl LaunchParams {
    pub fn bind(&mut self, extent: i64, parallel_type: ParallelType) {
        self.extents.insert(parallel_type, extent);
    }

    pub fn get(&self, parallel_type: ParallelType) -> Option<i64> {
        self.extents.get(&parallel_type).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParallelType, i64)> + '_ {
        self.extents.iter().map(|(pt, extent)| (*pt, *extent))
    }
}

/// Parameters of the pointwise schedule.
///
/// The reference loop nest is flattened to one axis, or to two axes split at
/// `break_point` when broadcasts make a 2-D traversal cheaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointwiseParams {
    pub index_type: IndexType,
    /// Reference axes `[0, break_point)` form the outer group; `0` means 1-D.
    pub break_point: usize,
    /// Bind part of the outer group to `TIDy`.
    pub split_block: bool,
    /// Split the `BIDy`-bound axis so that it fits the grid limit.
    pub split_grid_y_dim: bool,
    /// Bind the inner group to `BIDy` and the outer group to `BIDx`.
    pub flip_grid_binding: bool,
    pub vectorize: bool,
    /// Vector width when vectorizing, unroll factor otherwise.
    pub unroll_factor: i64,
    /// Grid-y limit the schedule splits against.
    pub max_grid_y: i64,
    pub launch: LaunchParams,
}

impl Default for PointwiseParams {
    fn default() -> Self {
        Self {
            index_type: IndexType::default(),
            break_point: 0,
            split_block: false,
            split_grid_y_dim: false,
            flip_grid_binding: false,
            vectorize: false,
            unroll_factor: 1,
            max_grid_y: 65535,
            launch: LaunchParams::default(),
        }
    }
}

impl PointwiseParams {
    pub fn with_index_type(index_type: IndexType) -> Self {
        Self { index_type, ..Self::default() }
    }
}

impl fmt::Display for PointwiseParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pointwise(")?;
        if self.break_point > 0 {
            write!(f, "2D break_point={}", self.break_point)?;
            if self.split_block {
                write!(f, " split_block")?;
            }
            if self.flip_grid_binding {
                write!(f, " flip_grid")?;
            }
            if self.split_grid_y_dim {
                write!(f, " split_grid_y")?;
            }
        } else {
            write!(f, "1D")?;
        }
        if self.vectorize {
            write!(f, ", vectorize={}", self.unroll_factor)?;
        } else if self.unroll_factor > 1 {
            write!(f, ", unroll={}", self.unroll_factor)?;
        }
        for (pt, extent) in self.launch.iter() {
            write!(f, ", {pt}={extent}")?;
        }
        write!(f, ", index={:?})", self.index_type)
    }
}

/// Parameters chosen by one heuristic for one fusion shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeuristicParams {
    ExprEval,
    NoOp,
    PointWise(PointwiseParams),
}

impl HeuristicParams {
    pub fn heuristic(&self) -> ScheduleHeuristic {
        match self {
            Self::ExprEval => ScheduleHeuristic::ExprEval,
            Self::NoOp => ScheduleHeuristic::NoOp,
            Self::PointWise(_) => ScheduleHeuristic::PointWise,
        }
    }

    pub fn as_pointwise(&self) -> Option<&PointwiseParams> {
        match self {
            Self::PointWise(params) => Some(params),
            _ => None,
        }
    }
}

impl fmt::Display for HeuristicParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExprEval => write!(f, "ExprEval"),
            Self::NoOp => write!(f, "NoOp"),
            Self::PointWise(params) => params.fmt(f),
        }
    }
}
