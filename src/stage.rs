//! Offscreen stage management.
//!
//! A [`StageHost`] plays the part of the document body: it owns the set of
//! attached offscreen containers and leases them out one at a time. Each
//! stage walks a fixed typestate path, so capture is only reachable after
//! the readiness gate and the offset compositor have run:
//!
//! ```text
//! OffscreenStage --ready()--> ReadyStage --with_offsets_applied()--> CompositedStage
//!                                  ^                                       |
//!                                  +---------------restore()---------------+
//! ```
//!
//! Dropping any of them detaches the container, on success and error paths
//! alike.

use crate::error::{CertError, Result};
use crate::font::FontBook;
use crate::layout::layout;
use crate::offsets::{OffsetMap, OffsetUndo, OriginalPositions, apply_offsets};
use crate::raster::{CaptureResult, capture};
use crate::readiness::{ResourceGate, StageResources};
use crate::record::FieldValueRecord;
use crate::render::{ROOT_ID, VisualTree, render};
use crate::template::TemplateLayout;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// Stage containers sit this far left of the visible viewport.
pub const OFFSCREEN_LEFT: i32 = -9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

#[derive(Debug, Default)]
struct HostState {
    next_id: u64,
    attached: BTreeMap<ContainerId, (i32, i32)>,
    lease_holder: Option<ThreadId>,
}

#[derive(Debug, Default)]
pub struct StageHost {
    state: Mutex<HostState>,
    lease: Mutex<()>,
    gate: ResourceGate,
}

impl StageHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self) -> &ResourceGate {
        &self.gate
    }

    /// Offscreen containers attached right now.
    pub fn attached_count(&self) -> usize {
        self.state().attached.len()
    }

    /// Attaches a fresh container and mounts one rendered record into it.
    ///
    /// Blocks while another thread holds a stage of this host. Fails with
    /// [`CertError::StageLeased`] when the calling thread holds one itself.
    pub fn mount<'a>(
        &'a self,
        template: &TemplateLayout,
        values: &FieldValueRecord,
    ) -> Result<OffscreenStage<'a>> {
        let current = thread::current().id();
        if self.state().lease_holder == Some(current) {
            return Err(CertError::StageLeased);
        }
        let lease = self.lease.lock().unwrap_or_else(|p| p.into_inner());
        let id = self.attach(current);
        let mut instance = StageInstance {
            host: self,
            id,
            tree: None,
            _lease: lease,
        };
        log::debug!("stage {:?} attached at left {OFFSCREEN_LEFT}", id);

        // On error `instance` drops here and detaches the container.
        let tree = render(values, template, &OffsetMap::default())?;
        if tree.find_by_id(ROOT_ID).is_none() {
            return Err(CertError::MissingStageElement(format!(
                "#{ROOT_ID} not found after mount"
            )));
        }
        instance.tree = Some(tree);
        Ok(OffscreenStage { inner: instance })
    }

    /// Runs `f` with a mounted stage; the stage is disposed when `f` returns.
    pub fn with_offscreen_stage<'a, T>(
        &'a self,
        template: &TemplateLayout,
        values: &FieldValueRecord,
        f: impl FnOnce(OffscreenStage<'a>) -> Result<T>,
    ) -> Result<T> {
        let stage = self.mount(template, values)?;
        f(stage)
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn attach(&self, holder: ThreadId) -> ContainerId {
        let mut state = self.state();
        state.lease_holder = Some(holder);
        let id = ContainerId(state.next_id);
        state.next_id += 1;
        state.attached.insert(id, (OFFSCREEN_LEFT, 0));
        id
    }

    fn detach(&self, id: ContainerId) {
        let mut state = self.state();
        state.lease_holder = None;
        if state.attached.remove(&id).is_some() {
            log::debug!("stage {:?} detached", id);
        }
    }
}

// Field order matters: the container detaches before the lease is released.
#[derive(Debug)]
struct StageInstance<'a> {
    host: &'a StageHost,
    id: ContainerId,
    tree: Option<VisualTree>,
    _lease: MutexGuard<'a, ()>,
}

impl StageInstance<'_> {
    fn tree(&self) -> Result<&VisualTree> {
        self.tree
            .as_ref()
            .ok_or_else(|| CertError::MissingStageElement(format!("#{ROOT_ID}")))
    }

    fn tree_mut(&mut self) -> Result<&mut VisualTree> {
        self.tree
            .as_mut()
            .ok_or_else(|| CertError::MissingStageElement(format!("#{ROOT_ID}")))
    }
}

impl Drop for StageInstance<'_> {
    fn drop(&mut self) {
        self.tree = None;
        self.host.detach(self.id);
    }
}

/// A mounted stage whose resources have not settled yet.
#[derive(Debug)]
pub struct OffscreenStage<'a> {
    inner: StageInstance<'a>,
}

impl<'a> OffscreenStage<'a> {
    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    /// Settles fonts and images, then measures the tree.
    pub fn ready(mut self, fonts: &'a FontBook) -> Result<ReadyStage<'a>> {
        let resources = self.inner.host.gate.await_ready(self.inner.tree()?, fonts);
        layout(self.inner.tree_mut()?, fonts, &resources);
        Ok(ReadyStage {
            inner: self.inner,
            fonts,
            resources,
        })
    }

    pub fn dispose(self) {}
}

/// A measured stage. Its natural positions are final.
#[derive(Debug)]
pub struct ReadyStage<'a> {
    inner: StageInstance<'a>,
    fonts: &'a FontBook,
    resources: StageResources,
}

impl<'a> ReadyStage<'a> {
    pub fn tree(&self) -> Result<&VisualTree> {
        self.inner.tree()
    }

    pub fn resources(&self) -> &StageResources {
        &self.resources
    }

    pub fn natural_positions(&self) -> Result<OriginalPositions> {
        Ok(OriginalPositions::capture(self.inner.tree()?))
    }

    /// Applies `offsets` on top of `original`. On error the stage is disposed.
    pub fn with_offsets_applied(
        mut self,
        original: &OriginalPositions,
        offsets: &OffsetMap,
    ) -> Result<CompositedStage<'a>> {
        let undo = apply_offsets(self.inner.tree_mut()?, original, offsets)?;
        Ok(CompositedStage { ready: self, undo })
    }

    pub fn dispose(self) {}
}

/// A stage with export offsets applied, ready for capture.
#[derive(Debug)]
pub struct CompositedStage<'a> {
    ready: ReadyStage<'a>,
    undo: OffsetUndo,
}

impl<'a> CompositedStage<'a> {
    pub fn tree(&self) -> Result<&VisualTree> {
        self.ready.tree()
    }

    pub fn capture(&self, scale: u32) -> Result<CaptureResult> {
        capture(
            self.ready.tree()?,
            &self.ready.resources,
            self.ready.fonts,
            scale,
        )
    }

    /// Undoes the offsets, giving back the measured stage.
    pub fn restore(self) -> Result<ReadyStage<'a>> {
        let CompositedStage { mut ready, undo } = self;
        undo.undo(ready.inner.tree_mut()?);
        Ok(ready)
    }
}

/// The visible, caller-owned rendering. Exports only ever borrow it.
#[derive(Debug, Clone)]
pub struct Preview {
    tree: VisualTree,
    resources: StageResources,
}

impl Preview {
    /// Renders with `offsets` (usually empty), settles resources and measures.
    pub fn render(
        template: &TemplateLayout,
        values: &FieldValueRecord,
        offsets: &OffsetMap,
        fonts: &FontBook,
        gate: &ResourceGate,
    ) -> Result<Self> {
        let mut tree = render(values, template, offsets)?;
        let resources = gate.await_ready(&tree, fonts);
        layout(&mut tree, fonts, &resources);
        Ok(Self { tree, resources })
    }

    pub fn tree(&self) -> &VisualTree {
        &self.tree
    }

    pub fn positions(&self) -> OriginalPositions {
        OriginalPositions::capture(&self.tree)
    }

    pub fn capture(&self, fonts: &FontBook, scale: u32) -> Result<CaptureResult> {
        capture(&self.tree, &self.resources, fonts, scale)
    }
}
