//! Scheduler registry and pointwise scheduler for fusor fusions.
//!
//! A fusion is offered to every registered scheduler in a fixed priority
//! order; the first one whose compile-time and run-time checks accept it
//! computes heuristic parameters and then rewrites the fusion's loop
//! structure (splits, merges, parallel bindings, inlining, memory types).
//!
//! # Module Organization
//!
//! - [`registry`] - [`Scheduler`] trait, eligibility checks, priority-ordered proposal
//! - [`summary`] - [`HeuristicSummary`], memoized compile-time analyses with record/replay modes
//! - [`cache`] - [`HeuristicCache`], summaries and parameters per shape class
//! - [`runtime_info`] - argument-dependent facts: evaluator, index type, alignment
//! - [`pointwise`] - pointwise heuristics and schedule
//! - [`transpose`] - transpose feasibility, consulted by the pointwise run-time check
//! - [`no_op`], [`expr_eval`] - schedulers that generate no kernel
//! - [`domain_map`], [`utils`], [`vectorize`], [`propagate`] - analyses and rewrites shared by schedulers
//!
//! # Logging
//!
//! Every rejected candidate is logged at `debug` level with target
//! `fusor_schedule::reject` and the fields `heuristic` and `reason`.

pub mod cache;
pub mod config;
pub mod domain_map;
pub mod error;
pub mod expr_eval;
pub mod heuristic;
pub mod no_op;
pub mod params;
pub mod pointwise;
pub mod propagate;
pub mod registry;
pub mod runtime_info;
pub mod summary;
pub mod transpose;
pub mod utils;
pub mod vectorize;


pub use cache::{CachedHeuristics, HeuristicCache, ShapeClass};
pub use config::{DeviceProperties, PointwiseConfig};
pub use domain_map::DomainMap;
pub use error::{Error, Result};
pub use heuristic::{ALL_HEURISTICS_IN_PRIORITY_ORDER, ScheduleHeuristic};
pub use params::{HeuristicParams, LaunchParams, PointwiseParams};
pub use pointwise::{PointWiseScheduler, get_pointwise_heuristics, schedule_pointwise};
pub use registry::{Eligibility, Scheduler, SchedulerEntry, SchedulerRegistry};
pub use runtime_info::SchedulerRuntimeInfo;
pub use summary::{EntryType, HeuristicSummary};
