//! NexaOS Display Pipeline Controller
//!
//! Drives the display pipelines of a SoC: which hardware blocks form each
//! path, how they are wired and armed on a sync mutex, how a frame's
//! configuration reaches the hardware through command batches, and which
//! hardware-resident loops keep frames flowing without the CPU.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         DisplaySubsystem                             │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌────────────────────────┐  │
//! │  │  SocTable    │  │ Registry         │  │ MutexAllocator         │  │
//! │  │  topology    │  │ blocks + owners  │  │ members, sync source   │  │
//! │  └──────────────┘  └──────────────────┘  └────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │ DisplayPipeline (one per display)                              │  │
//! │  │   PathGraph ── commit ── LoopControl ── dual coordinator       │  │
//! │  │   workers: trigger-delay │ kick │ mode-switch │ fence-release  │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                     CmdqEngine (SimEngine in tests)                  │
//! │      config thread │ trigger loop │ event loop │ semaphores │ memory │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dpc::{
//!     cmdq::SimEngine, Collaborators, DisplayConfig, DisplaySubsystem, FrameConfig,
//!     LayerConfig, PanelConfig, PlatformConfig, SocVariant,
//! };
//!
//! let panel = PanelConfig::new(1080, 2400, 60);
//! let cfg = PlatformConfig::with_displays(SocVariant::Mt6985, vec![DisplayConfig::new(0, panel)]);
//! let engine = Arc::new(SimEngine::new(6));
//! let subsystem = DisplaySubsystem::new(cfg, engine.clone())?;
//! let disp = subsystem.create_display(0, Collaborators::default())?;
//! disp.enable()?;
//! disp.commit(&FrameConfig::new().with_layer(LayerConfig::full_screen(0, 1080, 2400)))?;
//! engine.tick();
//! # Ok::<(), dpc::DpcError>(())
//! ```

pub mod cmdq;
pub mod collab;
pub mod commit;
pub mod component;
pub mod config;
pub mod diag;
pub mod display;
pub mod dual;
pub mod error;
pub mod logger;
pub mod loops;
pub mod mutex;
pub mod path;
pub mod workers;

pub use cmdq::{CmdqEngine, CommandBatch, EventName, SimEngine};
pub use collab::{Collaborators, FenceSink, LayeringRule, LogCollaborator, PowerHooks, QosSink};
pub use commit::{FrameConfig, LayerConfig};
pub use component::{ComponentId, DriveMode, Rect, SocVariant};
pub use config::{DisplayConfig, PanelConfig, PlatformConfig};
pub use display::{DisplayPipeline, DisplaySubsystem, FrameCounters};
pub use dual::Geometry;
pub use error::{DpcError, DpcResult};
pub use loops::{LoopKind, LoopState};
pub use mutex::SyncSource;
pub use path::{DisplayMode, PipeId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
