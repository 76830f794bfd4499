//! Path graph mutation
//!
//! Ordering rules every mutation follows:
//!
//! - connect: wire, then arm on the mutex
//! - disconnect: disarm, then unwire
//! - splice: stop, disarm + unwire, power down the dropped engines,
//!   select, power up the joining engines, wire, re-arm
//!
//! The wiring shadow is updated one register pair at a time, so a batch
//! that runs out of room mid-sequence leaves components detached, never
//! wired twice.

use std::collections::{BTreeMap, BTreeSet};

use super::{addon_out, sel_in, sel_out, sel_value, DisplayMode, Link, Path, PipeId, SEL_NONE};
use crate::cmdq::CommandBatch;
use crate::component::soc::{AddonScenario, DisplayTopology};
use crate::component::{Capability, ComponentId, ComponentType, Registry};
use crate::dual::DualPipeMap;
use crate::error::{DpcError, DpcResult};
use crate::mutex::MutexAllocator;

/// Everything a graph mutation writes through
pub struct GraphCtx<'a> {
    pub registry: &'a mut Registry,
    pub mutexes: &'a mut MutexAllocator,
    pub batch: &'a mut CommandBatch,
}

/// Comparable view of wiring state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub links: BTreeMap<ComponentId, Link>,
    pub connected: BTreeSet<(DisplayMode, PipeId)>,
    pub addon_out: BTreeMap<ComponentId, ComponentId>,
}

/// One pipe's share of an attached addon
#[derive(Debug, Clone, PartialEq, Eq)]
struct AddonBranch {
    attach: ComponentId,
    modules: Vec<ComponentId>,
}

/// Paths of one display and the wiring they hold
#[derive(Debug, Clone)]
pub struct PathGraph {
    display: usize,
    topo: DisplayTopology,
    map: DualPipeMap,
    virtuals: BTreeSet<ComponentId>,
    mutex: usize,
    /// Second mutex arming the addon branches, on discrete-path SoCs
    addon_mutex: Option<usize>,
    mask: u32,
    dual: bool,
    paths: BTreeMap<(DisplayMode, PipeId), Path>,
    links: BTreeMap<ComponentId, Link>,
    connected: BTreeSet<(DisplayMode, PipeId)>,
    addon_out: BTreeMap<ComponentId, ComponentId>,
    addons: BTreeMap<String, Vec<AddonBranch>>,
}

impl PathGraph {
    pub fn new(
        topo: DisplayTopology,
        map: DualPipeMap,
        reg: &Registry,
        mutex: usize,
        mask: u32,
    ) -> DpcResult<Self> {
        validate_mask(&topo, mask)?;
        let virtuals = reg.iter().filter(|c| c.is_virtual()).map(|c| c.id).collect();
        let mut graph = Self {
            display: topo.index,
            topo,
            map,
            virtuals,
            mutex,
            addon_mutex: None,
            mask,
            dual: false,
            paths: BTreeMap::new(),
            links: BTreeMap::new(),
            connected: BTreeSet::new(),
            addon_out: BTreeMap::new(),
            addons: BTreeMap::new(),
        };
        graph.paths = graph.build_paths(mask);
        Ok(graph)
    }

    fn build_paths(&self, mask: u32) -> BTreeMap<(DisplayMode, PipeId), Path> {
        let engines = self.topo.select(mask);
        let mut paths = BTreeMap::new();
        for mode in DisplayMode::ALL {
            let primary = if mode == DisplayMode::NoUse {
                Path::empty(mode, PipeId::Pipe0)
            } else {
                let mut comps = engines.clone();
                comps.extend_from_slice(self.topo.tail(mode));
                Path { mode, pipe: PipeId::Pipe0, comps, engines: engines.len() }
            };
            let twin = self.mirror(&primary);
            paths.insert((mode, PipeId::Pipe0), primary);
            paths.insert((mode, PipeId::Pipe1), twin);
        }
        paths
    }

    /// Pipe 1 copy of a pipe 0 path. Placeholders keep their slot; real
    /// components without a twin are left out.
    fn mirror(&self, primary: &Path) -> Path {
        let mut comps = Vec::with_capacity(primary.comps.len());
        let mut engines = 0;
        for (i, id) in primary.comps.iter().enumerate() {
            let twin = if self.virtuals.contains(id) { *id } else { self.map.map(*id) };
            if twin.is_none() {
                log::debug!("[disp{}] {} has no twin, not mirrored", self.display, id);
                continue;
            }
            if i < primary.engines {
                engines += 1;
            }
            comps.push(twin);
        }
        Path { mode: primary.mode, pipe: PipeId::Pipe1, comps, engines }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn display(&self) -> usize {
        self.display
    }

    pub fn mutex(&self) -> usize {
        self.mutex
    }

    pub fn addon_mutex(&self) -> Option<usize> {
        self.addon_mutex
    }

    /// Arm addon branches on `m` instead of the path mutex. Refused while
    /// a branch is attached.
    pub fn set_addon_mutex(&mut self, m: usize) -> DpcResult<()> {
        if !self.addons.is_empty() {
            return Err(DpcError::InvalidArgument(format!(
                "disp{}: addon mutex changed with branches attached",
                self.display
            )));
        }
        self.addon_mutex = Some(m);
        Ok(())
    }

    /// Every mutex this display triggers, path mutex first
    pub fn mutexes(&self) -> Vec<usize> {
        std::iter::once(self.mutex).chain(self.addon_mutex).collect()
    }

    fn branch_mutex(&self) -> usize {
        self.addon_mutex.unwrap_or(self.mutex)
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn is_dual(&self) -> bool {
        self.dual
    }

    pub fn topology(&self) -> &DisplayTopology {
        &self.topo
    }

    pub fn dual_map(&self) -> &DualPipeMap {
        &self.map
    }

    /// Pipes a mutation touches
    pub fn pipes(&self) -> &'static [PipeId] {
        if self.dual {
            &PipeId::ALL
        } else {
            &PipeId::ALL[..1]
        }
    }

    pub fn path(&self, mode: DisplayMode, pipe: PipeId) -> Option<&Path> {
        self.paths.get(&(mode, pipe))
    }

    pub fn is_virtual(&self, id: ComponentId) -> bool {
        self.virtuals.contains(&id)
    }

    pub fn is_connected(&self, mode: DisplayMode, pipe: PipeId) -> bool {
        self.connected.contains(&(mode, pipe))
    }

    pub fn any_connected(&self) -> bool {
        !self.connected.is_empty()
    }

    pub fn link(&self, id: ComponentId) -> Option<Link> {
        self.links.get(&id).copied()
    }

    /// Real components of a mode across the active pipes
    pub fn components(&self, mode: DisplayMode) -> Vec<ComponentId> {
        self.pipes()
            .iter()
            .filter_map(|pipe| self.path(mode, *pipe))
            .flat_map(|path| path.comps.iter().copied())
            .filter(|id| !self.is_virtual(*id))
            .collect()
    }

    /// Real engines of a mode across the active pipes
    pub fn engines(&self, mode: DisplayMode) -> Vec<ComponentId> {
        self.pipes()
            .iter()
            .filter_map(|pipe| self.path(mode, *pipe))
            .flat_map(|path| path.engines().iter().copied())
            .filter(|id| !self.is_virtual(*id))
            .collect()
    }

    /// First real component of the sink stage
    pub fn sink_head(&self, mode: DisplayMode, pipe: PipeId) -> Option<ComponentId> {
        self.path(mode, pipe)?.tail().iter().copied().find(|id| !self.is_virtual(*id))
    }

    /// Output interface terminating a path
    pub fn output(&self, mode: DisplayMode, pipe: PipeId, reg: &Registry) -> Option<ComponentId> {
        self.path(mode, pipe)?.comps.iter().rev().copied().find(|id| {
            !self.is_virtual(*id)
                && reg.get(*id).map(|c| c.ty() == ComponentType::OutputInterface).unwrap_or(false)
        })
    }

    pub fn active_addons(&self) -> impl Iterator<Item = &str> {
        self.addons.keys().map(String::as_str)
    }

    pub fn addon_active(&self, name: &str) -> bool {
        self.addons.contains_key(name)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            links: self.links.clone(),
            connected: self.connected.clone(),
            addon_out: self.addon_out.clone(),
        }
    }

    /// Switch single/dual. Only valid while nothing is connected.
    pub fn set_dual(&mut self, dual: bool) -> DpcResult<()> {
        if self.any_connected() && dual != self.dual {
            return Err(DpcError::InvalidArgument(format!(
                "disp{}: pipe count change while connected",
                self.display
            )));
        }
        self.dual = dual;
        Ok(())
    }

    // =========================================================================
    // Wiring primitives
    // =========================================================================

    fn real(&self, comps: &[ComponentId]) -> Vec<ComponentId> {
        comps.iter().copied().filter(|id| !self.is_virtual(*id)).collect()
    }

    fn wire_one(
        &mut self,
        id: ComponentId,
        prev: ComponentId,
        next: ComponentId,
        batch: &mut CommandBatch,
    ) -> DpcResult<()> {
        batch.write_value(sel_in(id), sel_value(prev))?;
        batch.write_value(sel_out(id), sel_value(next))?;
        self.links.insert(id, Link { prev, next });
        Ok(())
    }

    fn unwire_one(&mut self, id: ComponentId, batch: &mut CommandBatch) -> DpcResult<()> {
        if !self.links.contains_key(&id) {
            return Ok(());
        }
        batch.write_value(sel_in(id), SEL_NONE)?;
        batch.write_value(sel_out(id), SEL_NONE)?;
        self.links.remove(&id);
        Ok(())
    }

    /// Wire adjacent real components; placeholders are skipped and the
    /// chain ends are left on the sentinel.
    fn wire_chain(&mut self, comps: &[ComponentId], batch: &mut CommandBatch) -> DpcResult<()> {
        let reals = self.real(comps);
        for (i, id) in reals.iter().enumerate() {
            let prev = if i == 0 { ComponentId::NONE } else { reals[i - 1] };
            let next = reals.get(i + 1).copied().unwrap_or(ComponentId::NONE);
            self.wire_one(*id, prev, next, batch)?;
        }
        Ok(())
    }

    fn claim_all(&self, ids: &[ComponentId], reg: &mut Registry) -> DpcResult<()> {
        for (i, id) in ids.iter().enumerate() {
            if let Err(err) = reg.claim(*id, self.display) {
                for done in &ids[..i] {
                    reg.release(*done, self.display);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Re-emit every routing register from the shadow (stall recovery)
    pub fn rewire(&self, batch: &mut CommandBatch) -> DpcResult<()> {
        for (id, link) in &self.links {
            batch.write_value(sel_in(*id), sel_value(link.prev))?;
            batch.write_value(sel_out(*id), sel_value(link.next))?;
        }
        for (attach, head) in &self.addon_out {
            batch.write_value(addon_out(*attach), sel_value(*head))?;
        }
        Ok(())
    }

    // =========================================================================
    // Connect / Disconnect
    // =========================================================================

    /// Wire and arm a mode on every active pipe
    pub fn connect(&mut self, mode: DisplayMode, ctx: &mut GraphCtx<'_>) -> DpcResult<()> {
        for pipe in self.pipes() {
            self.connect_pipe(mode, *pipe, ctx)?;
        }
        Ok(())
    }

    fn connect_pipe(&mut self, mode: DisplayMode, pipe: PipeId, ctx: &mut GraphCtx<'_>) -> DpcResult<()> {
        if self.is_connected(mode, pipe) {
            return Ok(());
        }
        let comps = match self.path(mode, pipe) {
            Some(path) if !path.is_empty() => path.comps.clone(),
            _ => return Ok(()),
        };
        let reals = self.real(&comps);
        self.claim_all(&reals, ctx.registry)?;
        self.wire_chain(&comps, ctx.batch)?;
        for id in &reals {
            ctx.mutexes.add(self.mutex, *id, ctx.batch)?;
        }
        self.connected.insert((mode, pipe));
        log::debug!("[disp{}] connected {}", self.display, self.paths[&(mode, pipe)]);
        Ok(())
    }

    /// Disarm and unwire a mode on every active pipe, detaching its addons
    pub fn disconnect(&mut self, mode: DisplayMode, ctx: &mut GraphCtx<'_>) -> DpcResult<()> {
        let attached: Vec<String> = self
            .addons
            .iter()
            .filter(|(_, branches)| {
                branches.iter().any(|b| {
                    self.pipes().iter().any(|pipe| {
                        self.path(mode, *pipe).map(|p| p.contains(b.attach)).unwrap_or(false)
                    })
                })
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in attached {
            self.disconnect_addon(&name, ctx)?;
        }
        for pipe in self.pipes() {
            self.disconnect_pipe(mode, *pipe, ctx)?;
        }
        Ok(())
    }

    fn disconnect_pipe(&mut self, mode: DisplayMode, pipe: PipeId, ctx: &mut GraphCtx<'_>) -> DpcResult<()> {
        if !self.is_connected(mode, pipe) {
            return Ok(());
        }
        let reals = match self.path(mode, pipe) {
            Some(path) => self.real(&path.comps),
            None => return Ok(()),
        };
        for id in &reals {
            ctx.mutexes.remove(self.mutex, *id, ctx.batch)?;
        }
        for id in &reals {
            self.unwire_one(*id, ctx.batch)?;
        }
        for id in &reals {
            ctx.registry.release(*id, self.display);
        }
        self.connected.remove(&(mode, pipe));
        log::debug!("[disp{}] disconnected {}/{}", self.display, mode, pipe);
        Ok(())
    }

    // =========================================================================
    // Splice
    // =========================================================================

    /// Replace the composition-engine subset feeding the sink stage.
    ///
    /// On connected modes the old engines are stopped, disarmed and
    /// unwired before the new subset is wired and re-armed. Engines
    /// leaving the path are powered down and engines joining it are
    /// powered up. Returns the wired engines per pipe: they are left
    /// stopped, to be configured once the tile overhead of the new paths
    /// is recorded.
    pub fn splice_subset(
        &mut self,
        mask: u32,
        ctx: &mut GraphCtx<'_>,
    ) -> DpcResult<Vec<(PipeId, ComponentId)>> {
        validate_mask(&self.topo, mask)?;
        if mask == self.mask {
            return Ok(Vec::new());
        }
        let live: Vec<(DisplayMode, PipeId)> = self.connected.iter().copied().collect();
        let old_engines: Vec<(DisplayMode, PipeId, Vec<ComponentId>)> = live
            .iter()
            .filter_map(|(mode, pipe)| {
                self.path(*mode, *pipe).map(|p| (*mode, *pipe, self.real(p.engines())))
            })
            .collect();
        let next_paths = self.build_paths(mask);
        let kept: BTreeSet<ComponentId> = live
            .iter()
            .filter_map(|key| next_paths.get(key))
            .flat_map(|p| self.real(p.engines()))
            .collect();

        // stop
        for (_, _, engines) in &old_engines {
            for id in engines {
                ctx.registry.dispatch(Capability::Stop, *id, ctx.batch)?;
            }
        }
        // detach: disarm before unwire, including the sink head's input
        for (mode, pipe, engines) in &old_engines {
            for id in engines {
                ctx.mutexes.remove(self.mutex, *id, ctx.batch)?;
            }
            for id in engines {
                self.unwire_one(*id, ctx.batch)?;
                if !kept.contains(id) {
                    ctx.registry.dispatch(Capability::Unprepare, *id, ctx.batch)?;
                }
                ctx.registry.release(*id, self.display);
            }
            if let Some(head) = self.sink_head(*mode, *pipe) {
                let next = self.link(head).map(|l| l.next).unwrap_or(ComponentId::NONE);
                self.wire_one(head, ComponentId::NONE, next, ctx.batch)?;
            }
        }
        let powered: BTreeSet<ComponentId> =
            old_engines.iter().flat_map(|(_, _, engines)| engines.iter().copied()).collect();

        // select, keeping bit-index order
        self.paths = next_paths;
        self.mask = mask;
        log::info!("[disp{}] engine subset now {:#b}", self.display, mask);

        let mut wired = Vec::new();
        for (mode, pipe) in &live {
            let (comps, engines) = match self.path(*mode, *pipe) {
                Some(path) => (path.comps.clone(), self.real(path.engines())),
                None => continue,
            };
            self.claim_all(&engines, ctx.registry)?;
            for id in engines.iter().filter(|id| !powered.contains(id)) {
                ctx.registry.dispatch(Capability::Prepare, *id, ctx.batch)?;
            }
            // wire
            self.wire_chain(&comps, ctx.batch)?;
            // re-arm
            for id in &engines {
                ctx.mutexes.add(self.mutex, *id, ctx.batch)?;
            }
            wired.extend(engines.into_iter().map(|id| (*pipe, id)));
        }
        Ok(wired)
    }

    // =========================================================================
    // Addons
    // =========================================================================

    /// Attach an addon branch on every active pipe it can be mirrored to
    pub fn connect_addon(&mut self, scenario: &AddonScenario, ctx: &mut GraphCtx<'_>) -> DpcResult<()> {
        if self.addon_active(scenario.name) {
            return Ok(());
        }
        if !self.links.contains_key(&scenario.attach_after) {
            return Err(DpcError::InvalidArgument(format!(
                "addon '{}': {} not wired",
                scenario.name, scenario.attach_after
            )));
        }
        let mut branches = vec![AddonBranch {
            attach: scenario.attach_after,
            modules: self.real(&scenario.modules),
        }];
        if self.dual {
            let attach = self.map.map(scenario.attach_after);
            let modules: Vec<ComponentId> =
                scenario.modules.iter().map(|id| self.map.map(*id)).collect();
            if attach.is_none() || modules.iter().any(|id| id.is_none()) {
                log::debug!("[disp{}] addon '{}' not mirrored", self.display, scenario.name);
            } else {
                branches.push(AddonBranch { attach, modules: self.real(&modules) });
            }
        }

        let all: Vec<ComponentId> = branches.iter().flat_map(|b| b.modules.clone()).collect();
        self.claim_all(&all, ctx.registry)?;
        for branch in &branches {
            let head = branch.modules.first().copied().unwrap_or(ComponentId::NONE);
            ctx.batch.write_value(addon_out(branch.attach), sel_value(head))?;
            self.addon_out.insert(branch.attach, head);
            for (i, id) in branch.modules.iter().enumerate() {
                let prev = if i == 0 { branch.attach } else { branch.modules[i - 1] };
                let next = branch.modules.get(i + 1).copied().unwrap_or(ComponentId::NONE);
                self.wire_one(*id, prev, next, ctx.batch)?;
            }
            for id in &branch.modules {
                ctx.mutexes.add(self.branch_mutex(), *id, ctx.batch)?;
            }
        }
        log::debug!("[disp{}] addon '{}' attached", self.display, scenario.name);
        self.addons.insert(scenario.name.to_string(), branches);
        Ok(())
    }

    /// Detach an addon branch; unknown names are a no-op
    pub fn disconnect_addon(&mut self, name: &str, ctx: &mut GraphCtx<'_>) -> DpcResult<()> {
        let branches = match self.addons.get(name) {
            Some(branches) => branches.clone(),
            None => return Ok(()),
        };
        for branch in &branches {
            for id in &branch.modules {
                ctx.mutexes.remove(self.branch_mutex(), *id, ctx.batch)?;
            }
            for id in &branch.modules {
                self.unwire_one(*id, ctx.batch)?;
                ctx.registry.release(*id, self.display);
            }
            ctx.batch.write_value(addon_out(branch.attach), SEL_NONE)?;
            self.addon_out.remove(&branch.attach);
        }
        self.addons.remove(name);
        log::debug!("[disp{}] addon '{}' detached", self.display, name);
        Ok(())
    }
}

fn validate_mask(topo: &DisplayTopology, mask: u32) -> DpcResult<()> {
    if mask == 0 || mask & !topo.full_mask() != 0 {
        return Err(DpcError::InvalidArgument(format!(
            "engine mask {:#b} invalid for disp{}",
            mask, topo.index
        )));
    }
    Ok(())
}
