#![forbid(unsafe_code)]

//! Property tests for [`ElementTree`] invariants.
//!
//! Validates:
//! - After any sequence of deltas, `widget_ids()` equals the ids attached to
//!   the widget-bearing elements a simple reference model holds.
//! - A rejected delta leaves the tree unchanged.
//! - Within one run, a widget add is rejected as a collision exactly when a
//!   full scan of the tree finds the id at another path.

use std::collections::BTreeSet;

use proptest::prelude::*;
use wisp_core::{
    BlockKind, DeltaOp, DeltaPath, ElementSpec, ElementTree, RunStamp, ScriptRunId, TreeError,
    WidgetId, WidgetSpec,
};

// ============================================================================
// Reference model: main container holding elements and one-level blocks
// ============================================================================

#[derive(Debug, Clone)]
enum ModelNode {
    Element(Option<u8>),
    Block(Vec<Option<u8>>),
}

#[derive(Debug, Clone)]
enum Op {
    AddTop { index: usize, widget: Option<u8> },
    AddBlock { index: usize },
    AddNested { block: usize, index: usize, widget: Option<u8> },
    RemoveTop { index: usize },
    RemoveNested { block: usize, index: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let widget = prop::option::of(0u8..12);
    prop_oneof![
        3 => (0usize..6, widget.clone()).prop_map(|(index, widget)| Op::AddTop { index, widget }),
        2 => (0usize..6).prop_map(|index| Op::AddBlock { index }),
        3 => (0usize..6, 0usize..6, widget)
            .prop_map(|(block, index, widget)| Op::AddNested { block, index, widget }),
        1 => (0usize..6).prop_map(|index| Op::RemoveTop { index }),
        1 => (0usize..6, 0usize..6).prop_map(|(block, index)| Op::RemoveNested { block, index }),
    ]
}

fn element(widget: Option<u8>) -> ElementSpec {
    match widget {
        Some(n) => ElementSpec::widget("text_input", WidgetSpec::new(WidgetId::new(format!("w{n}")))),
        None => ElementSpec::new("markdown"),
    }
}

fn model_ids(model: &[ModelNode]) -> BTreeSet<WidgetId> {
    let mut ids = BTreeSet::new();
    for node in model {
        match node {
            ModelNode::Element(Some(n)) => {
                ids.insert(WidgetId::new(format!("w{n}")));
            }
            ModelNode::Element(None) => {}
            ModelNode::Block(children) => {
                for n in children.iter().flatten() {
                    ids.insert(WidgetId::new(format!("w{n}")));
                }
            }
        }
    }
    ids
}

fn place<T>(items: &mut Vec<T>, index: usize, item: T) -> bool {
    if index < items.len() {
        items[index] = item;
        true
    } else if index == items.len() {
        items.push(item);
        true
    } else {
        false
    }
}

/// Apply `op` to the model; returns the delta to send and whether the model
/// accepted it.
fn step(model: &mut Vec<ModelNode>, op: &Op) -> (DeltaPath, DeltaOp, bool) {
    match *op {
        Op::AddTop { index, widget } => {
            let ok = place(model, index, ModelNode::Element(widget));
            (DeltaPath::new(vec![0, index]), DeltaOp::AddElement(element(widget)), ok)
        }
        Op::AddBlock { index } => {
            let kept = match model.get(index) {
                Some(ModelNode::Block(children)) => children.clone(),
                _ => Vec::new(),
            };
            let ok = place(model, index, ModelNode::Block(kept));
            (DeltaPath::new(vec![0, index]), DeltaOp::AddBlock(BlockKind::Vertical), ok)
        }
        Op::AddNested { block, index, widget } => {
            let ok = match model.get_mut(block) {
                Some(ModelNode::Block(children)) => place(children, index, widget),
                _ => false,
            };
            (
                DeltaPath::new(vec![0, block, index]),
                DeltaOp::AddElement(element(widget)),
                ok,
            )
        }
        Op::RemoveTop { index } => {
            let ok = index < model.len();
            if ok {
                model.remove(index);
            }
            (DeltaPath::new(vec![0, index]), DeltaOp::Remove, ok)
        }
        Op::RemoveNested { block, index } => {
            let ok = match model.get_mut(block) {
                Some(ModelNode::Block(children)) if index < children.len() => {
                    children.remove(index);
                    true
                }
                _ => false,
            };
            (DeltaPath::new(vec![0, block, index]), DeltaOp::Remove, ok)
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn widget_ids_match_reference_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut tree = ElementTree::new();
        let mut model: Vec<ModelNode> = Vec::new();

        for (n, op) in ops.iter().enumerate() {
            // A fresh run per delta keeps repeated ids from counting as collisions.
            let stamp = RunStamp::new(ScriptRunId::new(format!("run-{n}")));
            let before = tree.widget_ids();
            let (path, delta, accepted) = step(&mut model, op);
            let result = tree.apply_delta(&path, delta, &stamp);

            prop_assert_eq!(result.is_ok(), accepted, "op {:?}", op);
            if !accepted {
                prop_assert_eq!(tree.widget_ids(), before);
            }
            prop_assert_eq!(tree.widget_ids(), model_ids(&model));
        }
    }

    #[test]
    fn collisions_match_full_scan(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let mut tree = ElementTree::new();
        let mut model: Vec<ModelNode> = Vec::new();
        let stamp = RunStamp::new(ScriptRunId::new("run-1"));

        for op in &ops {
            let mut next = model.clone();
            let (path, delta, accepted) = step(&mut next, op);
            let expected = match &delta {
                DeltaOp::AddElement(ElementSpec { widget: Some(widget), .. }) => tree
                    .widgets()
                    .into_iter()
                    .find(|(at, w)| w.id == widget.id && !at.is_within(&path))
                    .map(|(at, _)| at),
                _ => None,
            };

            match (tree.apply_delta(&path, delta, &stamp), expected) {
                (Err(TreeError::Collision(c)), Some(existing)) => {
                    prop_assert_eq!(c.existing, existing);
                }
                (result, None) => {
                    prop_assert_eq!(result.is_ok(), accepted, "op {:?}", op);
                    if accepted {
                        model = next;
                    }
                }
                (result, Some(existing)) => {
                    prop_assert!(false, "expected collision with {}, got {:?}", existing, result);
                }
            }
            prop_assert_eq!(tree.widget_ids(), model_ids(&model));
        }
    }
}
