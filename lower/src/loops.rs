//! Loop-nest generation.
//!
//! Tensor expressions are emitted in topological order. Each one is placed in
//! loops over its output's loop domain; the leading loops that are already
//! open and loop-mapped to the output's axes are reused, up to the deeper of
//! the output's compute-at position and its producers' compute-at position.

use fusor_ir::{IdMappingMode, IdRef};
use tracing::trace;

use crate::context::LoweringContext;
use crate::kir::{ForLoop, KirExpr, KirKind, NodeId};
use crate::utils::LoopInfo;

struct OpenLoop {
    info: LoopInfo,
    /// Loop-map representative, before loop promotion.
    concrete: IdRef,
    body: Vec<KirExpr>,
}

/// Builds the kernel IR loop nest for every expression of the fusion.
#[tracing::instrument(skip_all)]
pub fn build_loop_nest(ctx: &mut LoweringContext) -> Vec<KirExpr> {
    let mut top = Vec::new();
    let mut open: Vec<OpenLoop> = Vec::new();

    for expr in ctx.fusion().exprs() {
        let Some(out) = ctx.fusion().expr(expr).output(0) else {
            continue;
        };
        let view = ctx.fusion().tv(out);
        let shared_limit = view.max_producer_pos.max(view.compute_at_pos);
        let concrete: Vec<IdRef> =
            view.loop_domain().iter().map(|id| ctx.ca_map().concrete_mapped_id(*id, IdMappingMode::Loop)).collect();

        let reused = open
            .iter()
            .zip(&concrete)
            .take(shared_limit)
            .take_while(|(open_loop, id)| open_loop.concrete == **id)
            .count();
        close_loops(&mut open, &mut top, reused);

        for id in &concrete[reused..] {
            let info = LoopInfo { node: ctx.next_node_id(), iter_domain: ctx.loop_promotion.promoted(*id) };
            trace!(node = %info.node, iter_domain = %info.iter_domain, "open loop");
            open.push(OpenLoop { info, concrete: *id, body: Vec::new() });
        }

        let op = KirExpr { id: ctx.next_node_id(), kind: KirKind::TensorOp { expr } };
        match open.last_mut() {
            Some(innermost) => innermost.body.push(op),
            None => top.push(op),
        }
    }
    close_loops(&mut open, &mut top, 0);
    top
}

fn close_loops(open: &mut Vec<OpenLoop>, top: &mut Vec<KirExpr>, keep: usize) {
    while open.len() > keep {
        let Some(closed) = open.pop() else {
            break;
        };
        let node = KirExpr {
            id: closed.info.node,
            kind: KirKind::ForLoop(ForLoop { iter_domain: closed.info.iter_domain, body: closed.body }),
        };
        match open.last_mut() {
            Some(parent) => parent.body.push(node),
            None => top.push(node),
        }
    }
}

/// Loops enclosing the node `target`, outermost first.
pub fn enclosing_loops(exprs: &[KirExpr], target: NodeId) -> Option<Vec<LoopInfo>> {
    for expr in exprs {
        if expr.id == target {
            return Some(Vec::new());
        }
        if let KirKind::ForLoop(fl) = &expr.kind
            && let Some(mut inner) = enclosing_loops(&fl.body, target)
        {
            inner.insert(0, LoopInfo { node: expr.id, iter_domain: fl.iter_domain });
            return Some(inner);
        }
    }
    None
}
