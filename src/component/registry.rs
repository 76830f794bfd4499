//! Component Registry
//!
//! Dense arena of every component id. Indexing is identical on all SoC
//! variants; ids a variant lacks hold virtual placeholders.

use super::blocks::{
    ColorCorrector, Encoder, Histogram, Ovl, OutputInterface, Resizer, WritebackDma,
};
use super::soc::{BlockSpec, SocTable};
use super::{Capability, Component, ComponentId, ComponentKind, DdpConfig};
use crate::cmdq::CommandBatch;
use crate::error::{DpcError, DpcResult};

/// Id-indexed component arena
#[derive(Debug)]
pub struct Registry {
    comps: Vec<Component>,
}

impl Registry {
    /// Build the arena for a SoC table
    pub fn for_soc(soc: &SocTable) -> Self {
        let mut comps: Vec<Component> =
            ComponentId::all().map(Component::virtual_placeholder).collect();
        for (id, spec) in &soc.components {
            let block: Box<dyn super::Block> = match *spec {
                BlockSpec::Ovl => Box::new(Ovl::new(*id)),
                BlockSpec::Resizer => Box::new(Resizer::new(*id)),
                BlockSpec::Color { overhead } => Box::new(ColorCorrector::new(*id, overhead)),
                BlockSpec::Histogram => Box::new(Histogram::new(*id)),
                BlockSpec::Encoder => Box::new(Encoder::new(*id)),
                BlockSpec::Wdma => Box::new(WritebackDma::new(*id)),
                BlockSpec::Output { mode, dual_port } => {
                    Box::new(OutputInterface::new(*id, mode, dual_port))
                }
            };
            if let Some(slot) = comps.get_mut(id.index()) {
                slot.kind = ComponentKind::Real(block);
            }
        }
        log::debug!(
            "registry: {} real components for {:?}",
            comps.iter().filter(|c| !c.is_virtual()).count(),
            soc.variant
        );
        Self { comps }
    }

    pub fn len(&self) -> usize {
        self.comps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    pub fn get(&self, id: ComponentId) -> DpcResult<&Component> {
        self.comps.get(id.index()).ok_or(DpcError::NotFound(id))
    }

    pub fn get_mut(&mut self, id: ComponentId) -> DpcResult<&mut Component> {
        self.comps.get_mut(id.index()).ok_or(DpcError::NotFound(id))
    }

    pub fn is_virtual(&self, id: ComponentId) -> bool {
        self.get(id).map(Component::is_virtual).unwrap_or(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.comps.iter()
    }

    /// Route a capability call to a component.
    ///
    /// Placeholders and blocks lacking the capability accept the call as a
    /// no-op. Only an unknown id or a failing block operation is an error.
    pub fn dispatch(
        &mut self,
        cap: Capability<'_>,
        id: ComponentId,
        batch: &mut CommandBatch,
    ) -> DpcResult<()> {
        let comp = self.get_mut(id)?;
        let overhead = comp.overhead;
        let block = match &mut comp.kind {
            ComponentKind::Real(block) => block,
            ComponentKind::Virtual => return Ok(()),
        };
        if !block.caps().contains(cap.required()) {
            log::debug!("{}: no {} capability, skipped", id, cap.name());
            return Ok(());
        }
        match cap {
            Capability::Configure(cfg) => {
                let own = DdpConfig { overhead, ..*cfg };
                block.configure(&own, batch)
            }
            Capability::Start => block.start(batch),
            Capability::Stop => block.stop(batch),
            Capability::Reset => block.reset(batch),
            Capability::Prepare => block.prepare(batch),
            Capability::Unprepare => block.unprepare(batch),
            Capability::PartialUpdate(roi) => block.partial_update(&roi, batch),
            Capability::Bypass(enable) => block.bypass(enable, batch),
            Capability::Layer(layer) => block.layer(layer, batch),
        }
    }

    /// Claim a component for a display
    pub fn claim(&mut self, id: ComponentId, display: usize) -> DpcResult<()> {
        let comp = self.get_mut(id)?;
        if comp.is_virtual() {
            return Ok(());
        }
        match comp.owner {
            Some(owner) if owner != display => Err(DpcError::ComponentBusy { comp: id, owner }),
            _ => {
                comp.owner = Some(display);
                Ok(())
            }
        }
    }

    /// Clear the owner back-reference if `display` holds it
    pub fn release(&mut self, id: ComponentId, display: usize) {
        if let Ok(comp) = self.get_mut(id) {
            if comp.owner == Some(display) {
                comp.owner = None;
            }
        }
    }

    /// Re-instantiate an output interface after a connector change
    pub fn replace_output(
        &mut self,
        id: ComponentId,
        mode: super::DriveMode,
        dual_port: bool,
    ) -> DpcResult<()> {
        let comp = self.get_mut(id)?;
        if comp.ty() != super::ComponentType::OutputInterface {
            return Err(DpcError::InvalidArgument(format!("{} is not an output interface", id)));
        }
        comp.kind = ComponentKind::Real(Box::new(OutputInterface::new(id, mode, dual_port)));
        Ok(())
    }

    pub fn set_overhead(&mut self, id: ComponentId, overhead: u32) -> DpcResult<()> {
        self.get_mut(id)?.overhead = overhead;
        Ok(())
    }
}
