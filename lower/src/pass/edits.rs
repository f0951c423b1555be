//! Deferred insertions into a kernel IR tree.
//!
//! Passes walk an immutable tree and record [`Edit`]s; [`EditList::apply`]
//! then rebuilds the tree. Insertions before one anchor keep their
//! registration order. Each insertion after an anchor lands directly after
//! it, so later registrations end up closer to the anchor.

use crate::error::*;
use crate::kir::{KirExpr, KirKind, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditPosition {
    Before,
    After,
}

#[derive(Debug, Clone)]
pub struct Edit {
    /// Loop whose body holds the anchor; `None` for the top level.
    pub scope: Option<NodeId>,
    pub anchor: NodeId,
    pub position: EditPosition,
    pub node: KirExpr,
}

#[derive(Debug, Clone, Default)]
pub struct EditList {
    edits: Vec<Edit>,
}

impl EditList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_before(&mut self, scope: Option<NodeId>, anchor: NodeId, node: KirExpr) {
        self.edits.push(Edit { scope, anchor, position: EditPosition::Before, node });
    }

    pub fn insert_after(&mut self, scope: Option<NodeId>, anchor: NodeId, node: KirExpr) {
        self.edits.push(Edit { scope, anchor, position: EditPosition::After, node });
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Applies every edit in registration order.
    pub fn apply(self, mut exprs: Vec<KirExpr>) -> Result<Vec<KirExpr>> {
        for edit in self.edits {
            let body = match edit.scope {
                None => &mut exprs,
                Some(scope) => match find_loop_body(&mut exprs, scope) {
                    Some(body) => body,
                    None => return EditAnchorNotFoundSnafu { node: edit.anchor, scope: edit.scope }.fail(),
                },
            };
            let Some(pos) = body.iter().position(|e| e.id == edit.anchor) else {
                return EditAnchorNotFoundSnafu { node: edit.anchor, scope: edit.scope }.fail();
            };
            match edit.position {
                EditPosition::Before => body.insert(pos, edit.node),
                EditPosition::After => body.insert(pos + 1, edit.node),
            }
        }
        Ok(exprs)
    }
}

fn find_loop_body(exprs: &mut [KirExpr], scope: NodeId) -> Option<&mut Vec<KirExpr>> {
    for expr in exprs.iter_mut() {
        if expr.id == scope {
            return match &mut expr.kind {
                KirKind::ForLoop(fl) => Some(&mut fl.body),
                _ => None,
            };
        }
        for body in expr.bodies_mut() {
            if let Some(found) = find_loop_body(body, scope) {
                return Some(found);
            }
        }
    }
    None
}
