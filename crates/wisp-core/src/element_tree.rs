#![forbid(unsafe_code)]

//! Immutable element tree materialized from the backend's delta stream.
//!
//! The tree has four root containers (main, sidebar, event, bottom). Every
//! delta is addressed by a [`DeltaPath`] whose first index selects the root
//! container and whose remaining indices walk block children. Applying a
//! delta copies only the blocks along that path; every other subtree keeps
//! its `Arc`, so renderers can skip unchanged subtrees by pointer identity.
//!
//! # Invariants
//!
//! 1. `widget_ids()` is exactly the set of widget ids attached to elements
//!    currently in the tree.
//! 2. Among nodes stamped with the same script run, no two elements at
//!    different paths carry the same widget id.
//! 3. A delta that fails leaves the tree untouched.
//! 4. Every block on the path of an applied delta carries the delta's run, so
//!    clearing stale nodes after that run never removes the delta's target.
//!
//! # Collision index
//!
//! The tree remembers where each widget of the current run was added. A
//! collision check looks the id up and confirms the node is still there;
//! only when an entry has gone out of date (a removal shifted its siblings,
//! or a stale clear dropped it) does the check fall back to a full walk.
//!
//! # Failure Modes
//!
//! - **Stale UI**: a path that walks through a missing node or past the end
//!   of a block yields a [`TreeError`] with `is_stale_ui() == true`. The
//!   session shows a recoverable notice; the tree is unchanged.
//! - **Collision**: a second live widget with an existing id yields
//!   [`TreeError::Collision`], which is fatal to that render pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use im::Vector;

use crate::ids::{FormId, FragmentId, ScriptRunId, WidgetId};
use crate::widget::WidgetValue;

/// Element kind that counts as a form's submit trigger.
pub const SUBMIT_BUTTON_KIND: &str = "form_submit_button";

/// Top-level containers, addressed by the first path index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootContainer {
    Main,
    Sidebar,
    Event,
    Bottom,
}

impl RootContainer {
    pub const ALL: [Self; 4] = [Self::Main, Self::Sidebar, Self::Event, Self::Bottom];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Main => 0,
            Self::Sidebar => 1,
            Self::Event => 2,
            Self::Bottom => 3,
        }
    }

    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Main),
            1 => Some(Self::Sidebar),
            2 => Some(Self::Event),
            3 => Some(Self::Bottom),
            _ => None,
        }
    }
}

/// Address of a node: root container index followed by child indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeltaPath(Vec<usize>);

impl DeltaPath {
    #[must_use]
    pub fn new(indices: impl Into<Vec<usize>>) -> Self {
        Self(indices.into())
    }

    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Root container this path starts in.
    #[must_use]
    pub fn container(&self) -> Option<RootContainer> {
        self.0.first().copied().and_then(RootContainer::from_index)
    }

    /// Path of the `index`-th child of this node.
    #[must_use]
    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    /// True if `self` equals `ancestor` or lies beneath it.
    #[must_use]
    pub fn is_within(&self, ancestor: &DeltaPath) -> bool {
        self.0.starts_with(&ancestor.0)
    }
}

impl fmt::Display for DeltaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Which script run (and fragment) last produced a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunStamp {
    pub script_run_id: ScriptRunId,
    pub fragment_id: Option<FragmentId>,
}

impl RunStamp {
    #[must_use]
    pub fn new(script_run_id: ScriptRunId) -> Self {
        Self {
            script_run_id,
            fragment_id: None,
        }
    }

    #[must_use]
    pub fn with_fragment(mut self, fragment_id: Option<FragmentId>) -> Self {
        self.fragment_id = fragment_id;
        self
    }
}

/// Configuration carried by a form block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormBlock {
    pub form_id: FormId,
    pub clear_on_submit: bool,
    pub enter_to_submit: bool,
}

impl FormBlock {
    #[must_use]
    pub fn new(form_id: FormId) -> Self {
        Self {
            form_id,
            clear_on_submit: false,
            enter_to_submit: true,
        }
    }
}

/// Layout role of a block node.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Vertical,
    Horizontal,
    Column,
    Expander { label: String },
    Tab { label: String },
    Dialog { title: String },
    Form(FormBlock),
}

impl BlockKind {
    /// Whether re-adding `other` over `self` keeps the existing children.
    fn same_layout(&self, other: &BlockKind) -> bool {
        match (self, other) {
            (Self::Form(a), Self::Form(b)) => a.form_id == b.form_id,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

/// Widget binding of an element.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetSpec {
    pub id: WidgetId,
    pub form_id: Option<FormId>,
    /// Mount-time default, hydrated into the store.
    pub default: Option<WidgetValue>,
    /// Value the script assigned explicitly; overrides the stored value.
    pub forced: Option<WidgetValue>,
}

impl WidgetSpec {
    #[must_use]
    pub fn new(id: WidgetId) -> Self {
        Self {
            id,
            form_id: None,
            default: None,
            forced: None,
        }
    }

    #[must_use]
    pub fn in_form(mut self, form_id: FormId) -> Self {
        self.form_id = Some(form_id);
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: WidgetValue) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn with_forced(mut self, forced: WidgetValue) -> Self {
        self.forced = Some(forced);
        self
    }
}

/// Content of a leaf element. Rendering is out of scope; `props` is opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSpec {
    pub kind: String,
    pub widget: Option<WidgetSpec>,
    pub props: BTreeMap<String, String>,
}

impl ElementSpec {
    /// A non-interactive element.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            widget: None,
            props: BTreeMap::new(),
        }
    }

    /// An element bound to a widget.
    #[must_use]
    pub fn widget(kind: impl Into<String>, widget: WidgetSpec) -> Self {
        Self {
            kind: kind.into(),
            widget: Some(widget),
            props: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_submit_button(&self) -> bool {
        self.kind == SUBMIT_BUTTON_KIND
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockNode {
    pub kind: BlockKind,
    pub children: Vector<Node>,
    pub stamp: RunStamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    pub spec: ElementSpec,
    pub stamp: RunStamp,
}

/// A tree node. Cloning is cheap: both variants are reference counted.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Block(Arc<BlockNode>),
    Element(Arc<ElementNode>),
}

impl Node {
    #[must_use]
    pub fn stamp(&self) -> &RunStamp {
        match self {
            Self::Block(b) => &b.stamp,
            Self::Element(e) => &e.stamp,
        }
    }

    #[must_use]
    pub fn as_block(&self) -> Option<&Arc<BlockNode>> {
        match self {
            Self::Block(b) => Some(b),
            Self::Element(_) => None,
        }
    }

    #[must_use]
    pub fn as_element(&self) -> Option<&Arc<ElementNode>> {
        match self {
            Self::Element(e) => Some(e),
            Self::Block(_) => None,
        }
    }

    /// Pointer identity, for render diffing.
    #[must_use]
    pub fn ptr_eq(&self, other: &Node) -> bool {
        match (self, other) {
            (Self::Block(a), Self::Block(b)) => Arc::ptr_eq(a, b),
            (Self::Element(a), Self::Element(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Structural edit carried by a delta.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOp {
    AddBlock(BlockKind),
    AddElement(ElementSpec),
    Remove,
}

/// Two live widgets resolved to the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetIdCollisionError {
    pub id: WidgetId,
    pub existing: DeltaPath,
    pub incoming: DeltaPath,
}

impl fmt::Display for WidgetIdCollisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "widget id '{}' at {} collides with the widget already at {}",
            self.id, self.incoming, self.existing
        )
    }
}

impl std::error::Error for WidgetIdCollisionError {}

/// Errors from applying a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Path has fewer than two indices (container + position).
    PathTooShort(DeltaPath),
    /// First index names no root container.
    UnknownContainer(DeltaPath),
    /// An intermediate index does not exist.
    MissingNode(DeltaPath),
    /// An intermediate index names an element, not a block.
    NotABlock(DeltaPath),
    /// Final index is past the end of the parent block.
    IndexOutOfRange { path: DeltaPath, len: usize },
    Collision(WidgetIdCollisionError),
}

impl TreeError {
    /// Whether this error means the client's view of the UI is stale.
    #[must_use]
    pub fn is_stale_ui(&self) -> bool {
        !matches!(self, Self::Collision(_))
    }
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PathTooShort(p) => write!(f, "delta path {p} is too short"),
            Self::UnknownContainer(p) => write!(f, "delta path {p} names no root container"),
            Self::MissingNode(p) => write!(f, "no node at {p}"),
            Self::NotABlock(p) => write!(f, "node at {p} is not a block"),
            Self::IndexOutOfRange { path, len } => {
                write!(f, "delta path {path} is out of range (block has {len} children)")
            }
            Self::Collision(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Collision(err) => Some(err),
            _ => None,
        }
    }
}

/// The current UI structure.
#[derive(Debug, Clone)]
pub struct ElementTree {
    roots: [Arc<BlockNode>; 4],
    /// Run whose widgets `live_widgets` indexes.
    indexed_run: ScriptRunId,
    /// Where each widget of `indexed_run` was last added.
    live_widgets: BTreeMap<WidgetId, DeltaPath>,
}

impl Default for ElementTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementTree {
    /// An empty tree with four empty root containers.
    #[must_use]
    pub fn new() -> Self {
        let empty = || {
            Arc::new(BlockNode {
                kind: BlockKind::Vertical,
                children: Vector::new(),
                stamp: RunStamp::new(ScriptRunId::initial()),
            })
        };
        Self {
            roots: [empty(), empty(), empty(), empty()],
            indexed_run: ScriptRunId::initial(),
            live_widgets: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn root(&self, container: RootContainer) -> &Arc<BlockNode> {
        &self.roots[container.index()]
    }

    /// Look up the node at `path`.
    #[must_use]
    pub fn get(&self, path: &DeltaPath) -> Option<&Node> {
        let (&first, rest) = path.indices().split_first()?;
        let mut block = self.roots.get(first)?;
        let (&last, walk) = rest.split_last()?;
        for &index in walk {
            block = block.children.get(index)?.as_block()?;
        }
        block.children.get(last)
    }

    /// Apply one delta. On error the tree is unchanged.
    pub fn apply_delta(
        &mut self,
        path: &DeltaPath,
        op: DeltaOp,
        stamp: &RunStamp,
    ) -> Result<(), TreeError> {
        let Some((&first, rest)) = path.indices().split_first() else {
            return Err(TreeError::PathTooShort(path.clone()));
        };
        if rest.is_empty() {
            return Err(TreeError::PathTooShort(path.clone()));
        }
        let Some(container) = RootContainer::from_index(first) else {
            return Err(TreeError::UnknownContainer(path.clone()));
        };

        let incoming = match &op {
            DeltaOp::AddElement(ElementSpec {
                widget: Some(widget),
                ..
            }) => Some(widget.id.clone()),
            _ => None,
        };
        if let Some(id) = &incoming {
            self.index_run(&stamp.script_run_id);
            self.check_collision(id, path, &stamp.script_run_id)?;
        }

        let root = &self.roots[container.index()];
        let updated = apply_in(root, rest, 1, path, op, stamp)?;
        self.roots[container.index()] = updated;
        if let Some(id) = incoming {
            self.live_widgets.insert(id, path.clone());
        }
        Ok(())
    }

    /// Point the collision index at `run`, rebuilding it on a run change.
    fn index_run(&mut self, run: &ScriptRunId) {
        if self.indexed_run == *run {
            return;
        }
        let mut live = BTreeMap::new();
        self.walk(&mut |path, node| {
            if let Node::Element(element) = node
                && element.stamp.script_run_id == *run
                && let Some(widget) = &element.spec.widget
            {
                live.insert(widget.id.clone(), path.clone());
            }
        });
        self.live_widgets = live;
        self.indexed_run = run.clone();
    }

    /// Whether the node at `path` is the widget `id` added by `run`.
    fn holds_widget(&self, path: &DeltaPath, id: &WidgetId, run: &ScriptRunId) -> bool {
        self.get(path)
            .and_then(Node::as_element)
            .is_some_and(|element| {
                element.stamp.script_run_id == *run
                    && element.spec.widget.as_ref().is_some_and(|w| w.id == *id)
            })
    }

    fn check_collision(
        &self,
        id: &WidgetId,
        target: &DeltaPath,
        run: &ScriptRunId,
    ) -> Result<(), TreeError> {
        let Some(indexed) = self.live_widgets.get(id) else {
            return Ok(());
        };
        if self.holds_widget(indexed, id, run) {
            if indexed.is_within(target) {
                return Ok(());
            }
            return Err(TreeError::Collision(WidgetIdCollisionError {
                id: id.clone(),
                existing: indexed.clone(),
                incoming: target.clone(),
            }));
        }
        self.scan_for_collision(id, target, run)
    }

    fn scan_for_collision(
        &self,
        id: &WidgetId,
        target: &DeltaPath,
        run: &ScriptRunId,
    ) -> Result<(), TreeError> {
        let mut found = None;
        self.walk(&mut |path, node| {
            if found.is_some() || path.is_within(target) {
                return;
            }
            if let Node::Element(element) = node
                && element.stamp.script_run_id == *run
                && element.spec.widget.as_ref().is_some_and(|w| w.id == *id)
            {
                found = Some(path.clone());
            }
        });
        match found {
            Some(existing) => Err(TreeError::Collision(WidgetIdCollisionError {
                id: id.clone(),
                existing,
                incoming: target.clone(),
            })),
            None => Ok(()),
        }
    }

    /// Depth-first, in-order visit of every non-root node with its path.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&DeltaPath, &'a Node)) {
        for container in RootContainer::ALL {
            let path = DeltaPath::new(vec![container.index()]);
            walk_block(&self.roots[container.index()], &path, f);
        }
    }

    /// Every widget id attached to an element in the tree.
    #[must_use]
    pub fn widget_ids(&self) -> BTreeSet<WidgetId> {
        self.widgets()
            .into_iter()
            .map(|(_, widget)| widget.id.clone())
            .collect()
    }

    /// Every widget binding in the tree, with its path.
    #[must_use]
    pub fn widgets(&self) -> Vec<(DeltaPath, &WidgetSpec)> {
        let mut out = Vec::new();
        self.walk(&mut |path, node| {
            if let Node::Element(element) = node
                && let Some(widget) = &element.spec.widget
            {
                out.push((path.clone(), widget));
            }
        });
        out
    }

    /// Every form block in the tree.
    #[must_use]
    pub fn form_blocks(&self) -> Vec<&FormBlock> {
        let mut out = Vec::new();
        self.walk(&mut |_, node| {
            if let Node::Block(block) = node
                && let BlockKind::Form(form) = &block.kind
            {
                out.push(form);
            }
        });
        out
    }

    /// Submit-button count per form, including forms with none.
    #[must_use]
    pub fn form_submit_counts(&self) -> BTreeMap<FormId, usize> {
        let mut counts: BTreeMap<FormId, usize> = self
            .form_blocks()
            .into_iter()
            .map(|form| (form.form_id.clone(), 0))
            .collect();
        self.walk(&mut |_, node| {
            if let Node::Element(element) = node
                && element.spec.is_submit_button()
                && let Some(form_id) = element.spec.widget.as_ref().and_then(|w| w.form_id.as_ref())
            {
                *counts.entry(form_id.clone()).or_insert(0) += 1;
            }
        });
        counts
    }

    /// Remove nodes not produced by `run`.
    ///
    /// With `fragments == None` (a full run) every stale node goes. For a
    /// fragment run only stale nodes stamped with one of `fragments` go.
    /// Returns the number of nodes removed (subtrees count once).
    pub fn clear_stale_nodes(
        &mut self,
        run: &ScriptRunId,
        fragments: Option<&[FragmentId]>,
    ) -> usize {
        let mut removed = 0;
        for root in &mut self.roots {
            *root = clear_stale_block(root, run, fragments, &mut removed);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(target: "wisp.tree", run = %run, removed, "cleared stale nodes");
        removed
    }

    /// Drop every node and the collision index.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Total number of non-root nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_, _| count += 1);
        count
    }
}

fn walk_block<'a>(
    block: &'a BlockNode,
    path: &DeltaPath,
    f: &mut dyn FnMut(&DeltaPath, &'a Node),
) {
    for (index, child) in block.children.iter().enumerate() {
        let child_path = path.child(index);
        f(&child_path, child);
        if let Node::Block(inner) = child {
            walk_block(inner, &child_path, f);
        }
    }
}

/// Rebuild `block` with `op` applied at `rest`, copying only the spine.
fn apply_in(
    block: &Arc<BlockNode>,
    rest: &[usize],
    depth: usize,
    full_path: &DeltaPath,
    op: DeltaOp,
    stamp: &RunStamp,
) -> Result<Arc<BlockNode>, TreeError> {
    let Some((&index, tail)) = rest.split_first() else {
        return Err(TreeError::PathTooShort(full_path.clone()));
    };
    let mut children = block.children.clone();
    let len = children.len();

    if tail.is_empty() {
        match op {
            DeltaOp::Remove => {
                if index >= len {
                    return Err(TreeError::IndexOutOfRange {
                        path: full_path.clone(),
                        len,
                    });
                }
                children.remove(index);
            }
            DeltaOp::AddElement(spec) => {
                let node = Node::Element(Arc::new(ElementNode {
                    spec,
                    stamp: stamp.clone(),
                }));
                place(&mut children, index, node, full_path)?;
            }
            DeltaOp::AddBlock(kind) => {
                let kept = match children.get(index) {
                    Some(Node::Block(existing)) if existing.kind.same_layout(&kind) => {
                        existing.children.clone()
                    }
                    _ => Vector::new(),
                };
                let node = Node::Block(Arc::new(BlockNode {
                    kind,
                    children: kept,
                    stamp: stamp.clone(),
                }));
                place(&mut children, index, node, full_path)?;
            }
        }
    } else {
        let prefix = || DeltaPath::new(full_path.indices()[..=depth].to_vec());
        let child = match children.get(index) {
            Some(Node::Block(child)) => child,
            Some(Node::Element(_)) => return Err(TreeError::NotABlock(prefix())),
            None => return Err(TreeError::MissingNode(prefix())),
        };
        let updated = apply_in(child, tail, depth + 1, full_path, op, stamp)?;
        children.set(index, Node::Block(updated));
    }

    // The run now owns this block too; its fragment scope is unchanged.
    Ok(Arc::new(BlockNode {
        kind: block.kind.clone(),
        children,
        stamp: RunStamp {
            script_run_id: stamp.script_run_id.clone(),
            fragment_id: block.stamp.fragment_id.clone(),
        },
    }))
}

fn place(
    children: &mut Vector<Node>,
    index: usize,
    node: Node,
    full_path: &DeltaPath,
) -> Result<(), TreeError> {
    let len = children.len();
    if index < len {
        children.set(index, node);
        Ok(())
    } else if index == len {
        children.push_back(node);
        Ok(())
    } else {
        Err(TreeError::IndexOutOfRange {
            path: full_path.clone(),
            len,
        })
    }
}

fn is_stale(stamp: &RunStamp, run: &ScriptRunId, fragments: Option<&[FragmentId]>) -> bool {
    if stamp.script_run_id == *run {
        return false;
    }
    match fragments {
        None => true,
        Some(fragments) => stamp
            .fragment_id
            .as_ref()
            .is_some_and(|id| fragments.contains(id)),
    }
}

fn clear_stale_block(
    block: &Arc<BlockNode>,
    run: &ScriptRunId,
    fragments: Option<&[FragmentId]>,
    removed: &mut usize,
) -> Arc<BlockNode> {
    let mut changed = false;
    let mut kept = Vector::new();
    for child in block.children.iter() {
        if is_stale(child.stamp(), run, fragments) {
            *removed += 1;
            changed = true;
            continue;
        }
        match child {
            Node::Block(inner) => {
                let cleared = clear_stale_block(inner, run, fragments, removed);
                changed |= !Arc::ptr_eq(&cleared, inner);
                kept.push_back(Node::Block(cleared));
            }
            Node::Element(_) => kept.push_back(child.clone()),
        }
    }
    if !changed {
        return Arc::clone(block);
    }
    Arc::new(BlockNode {
        kind: block.kind.clone(),
        children: kept,
        stamp: block.stamp.clone(),
    })
}
