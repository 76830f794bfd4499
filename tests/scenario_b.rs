//! Dual-pipe split of the external display and tile overhead

mod common;

use std::collections::BTreeSet;

use common::{frame, Harness};
use dpc::component::blocks::{REG_LAYER_BASE, REG_POWER, REG_SRC_SIZE};
use dpc::{
    CmdqEngine, ComponentId, DisplayConfig, DisplayMode, DpcError, DriveMode, Geometry, PanelConfig, PipeId,
    SocVariant,
};

fn external() -> DisplayConfig {
    DisplayConfig::new(1, PanelConfig::new(1920, 1080, 60).video_mode())
}

fn geometry(width: u32, height: u32, refresh: u32) -> Geometry {
    Geometry { width, height, refresh, clock_khz: 0 }
}

/// Block register as last written by the engine
fn block_reg(h: &Harness, id: ComponentId, off: u64) -> u32 {
    h.engine.read_mem(id.regs_base() + off)
}

/// Width half of a packed size register
fn packed_width(value: u32) -> u32 {
    value & 0xffff
}

mod split_tests {
    use super::*;

    #[test]
    fn test_external_starts_single() {
        let h = Harness::new(SocVariant::Mt6985, vec![external()]);
        let disp = h.display(1);
        disp.enable().unwrap();

        assert_eq!(disp.drive_mode(), DriveMode::Continuous);
        assert!(!disp.is_dual());
        assert!(disp.is_connected(DisplayMode::Major, PipeId::Pipe0));
        assert!(!disp.is_connected(DisplayMode::Major, PipeId::Pipe1));
        assert!(h.engine.is_streaming(1), "continuous display streams after bring-up");
    }

    #[test]
    fn test_wide_geometry_splits_across_twins() {
        let h = Harness::new(SocVariant::Mt6985, vec![external()]);
        let disp = h.display(1);
        disp.enable().unwrap();
        h.frame(&disp, &frame(1920, 1080, 2, 1, 300));

        disp.set_geometry(geometry(3840, 1080, 120)).unwrap();
        assert!(disp.is_dual());
        assert!(disp.is_connected(DisplayMode::Major, PipeId::Pipe0));
        assert!(disp.is_connected(DisplayMode::Major, PipeId::Pipe1));

        let p0 = disp.path(DisplayMode::Major, PipeId::Pipe0).unwrap();
        let p1 = disp.path(DisplayMode::Major, PipeId::Pipe1).unwrap();
        let registry = h.subsystem.registry();
        let map = h.subsystem.dual_map();
        let mut twins = BTreeSet::new();
        for id in p0.comps.iter().filter(|id| !registry.is_virtual(**id)) {
            let twin = map.map(*id);
            assert!(!twin.is_none(), "{} has no twin", id);
            assert!(p1.contains(twin), "{} twin {} not in pipe 1", id, twin);
            assert!(twins.insert(twin), "twin {} shared", twin);
            assert_eq!(registry.get(twin).unwrap().owner(), Some(1));
        }
        drop(registry);

        let members = disp.mutex_members();
        for id in [ComponentId::OVL8, ComponentId::OVL9, ComponentId::DP_INTF1] {
            assert!(members.contains(&id), "{} not armed", id);
        }
        // External blocks read no context across the midline
        assert_eq!(disp.tile().total(), 0);

        h.frame(&disp, &frame(3840, 1080, 2, 2, 600));
        disp.wait_idle().unwrap();
        assert!(h.engine.is_streaming(1));
        assert_eq!(h.recorder.presents(), vec![1, 2]);
    }

    #[test]
    fn test_back_to_single_releases_twins() {
        let h = Harness::new(SocVariant::Mt6985, vec![external()]);
        let disp = h.display(1);
        disp.enable().unwrap();
        disp.set_geometry(geometry(3840, 1080, 120)).unwrap();
        disp.set_geometry(geometry(1920, 1080, 60)).unwrap();

        assert!(!disp.is_dual());
        assert!(!disp.is_connected(DisplayMode::Major, PipeId::Pipe1));
        let members = disp.mutex_members();
        for id in [ComponentId::OVL8, ComponentId::OVL9, ComponentId::DP_INTF1] {
            assert!(!members.contains(&id), "{} still armed", id);
            assert_eq!(h.subsystem.registry().get(id).unwrap().owner(), None);
        }
        assert!(!disp.snapshot().links.contains_key(&ComponentId::OVL8));
    }

    #[test]
    fn test_refresh_threshold_alone_splits() {
        let h = Harness::new(SocVariant::Mt6985, vec![external()]);
        let disp = h.display(1);
        disp.enable().unwrap();
        disp.set_geometry(geometry(1920, 1080, 120)).unwrap();
        assert!(disp.is_dual());
        assert_eq!(disp.geometry().refresh, 120);
    }

    #[test]
    fn test_odd_width_refused_path_untouched() {
        let h = Harness::new(SocVariant::Mt6985, vec![external()]);
        let disp = h.display(1);
        disp.enable().unwrap();
        let before = disp.snapshot();

        let err = disp.set_geometry(geometry(3841, 1080, 120)).unwrap_err();
        assert!(matches!(err, DpcError::InvalidGeometry(_)), "got {:?}", err);
        assert_eq!(disp.snapshot(), before);
        assert!(disp.is_connected(DisplayMode::Major, PipeId::Pipe0));
        assert_eq!(disp.geometry().width, 1920);
    }

    #[test]
    fn test_single_pipe_soc_never_splits() {
        let h = Harness::new(SocVariant::Mt6878, vec![external()]);
        let disp = h.display(1);
        disp.enable().unwrap();
        disp.set_geometry(geometry(3841, 1080, 120)).unwrap();
        assert!(!disp.is_dual());
        assert_eq!(disp.geometry().width, 3841);
    }
}

mod tile_tests {
    use super::*;

    fn dual_port_primary() -> DisplayConfig {
        DisplayConfig::new(0, PanelConfig::new(1440, 3200, 120).with_dual_port())
    }

    #[test]
    fn test_dual_port_primary_carries_overhead() {
        let h = Harness::new(SocVariant::Mt6985, vec![dual_port_primary()]);
        let disp = h.display(0);
        disp.enable().unwrap();

        assert!(disp.is_dual());
        let tile = disp.tile();
        assert!(tile.supported);
        assert_eq!(tile.total(), 8, "adaptive-luma context dominates");
        assert_eq!(tile.left_in_width, 720 + 8);
        assert_eq!(tile.right_in_width, 720 + tile.right_overhead);

        h.frame(&disp, &frame(1440, 3200, 4, 1, 900));
        disp.wait_idle().unwrap();
        assert_eq!(disp.counters().completed, 1);
    }

    #[test]
    fn test_minor_mode_has_no_overhead() {
        let h = Harness::new(SocVariant::Mt6985, vec![dual_port_primary()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        disp.request_mode(2).unwrap();

        assert_eq!(disp.mode(), DisplayMode::Minor);
        assert!(disp.is_connected(DisplayMode::Minor, PipeId::Pipe1));
        let tile = disp.tile();
        assert_eq!(tile.total(), 0);
        assert_eq!(tile.left_in_width, 720);

        let registry = h.subsystem.registry();
        assert_eq!(registry.get(ComponentId::AAL0).unwrap().owner(), None);
    }

    #[test]
    fn test_splice_configures_new_engines_with_overhead() {
        let panel = PanelConfig::new(1920, 1080, 60).with_dual_port();
        let h = Harness::new(SocVariant::Mt6985, vec![DisplayConfig::new(0, panel)]);
        let disp = h.display(0);
        disp.enable().unwrap();
        assert!(disp.is_dual());
        assert_eq!(packed_width(block_reg(&h, ComponentId::OVL0, REG_SRC_SIZE)), 968);

        disp.splice(0b110).unwrap();
        assert_eq!(disp.engine_mask(), 0b110);
        assert_eq!(disp.tile().left_in_width, 968);
        for id in [ComponentId::OVL1, ComponentId::OVL2, ComponentId::OVL4, ComponentId::OVL5] {
            let width = packed_width(block_reg(&h, id, REG_SRC_SIZE));
            assert_eq!(width, 968, "{} src width", id);
            assert_eq!(block_reg(&h, id, REG_POWER), 1, "{} powered", id);
        }
        for id in [ComponentId::OVL0, ComponentId::OVL3] {
            assert_eq!(block_reg(&h, id, REG_POWER), 0, "{} powered down", id);
        }

        h.frame(&disp, &frame(1920, 1080, 2, 1, 300));
        disp.wait_idle().unwrap();
        assert_eq!(disp.counters().completed, 1);
    }

    #[test]
    fn test_layers_fetch_across_midline() {
        let h = Harness::new(SocVariant::Mt6985, vec![dual_port_primary()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        assert_eq!(disp.tile().left_overhead, 8);

        h.frame(&disp, &frame(1440, 3200, 1, 1, 900));
        disp.wait_idle().unwrap();

        // layer 0 source size sits 0x0c into its slot
        for id in [ComponentId::OVL0, ComponentId::OVL3] {
            assert_eq!(packed_width(block_reg(&h, id, REG_SRC_SIZE)), 728, "{} input", id);
            let fetched = packed_width(block_reg(&h, id, REG_LAYER_BASE + 0x0c));
            assert_eq!(fetched, 728, "{} layer fetch width", id);
        }
    }

    #[test]
    fn test_overhead_disabled_by_platform() {
        let mut cfg = dpc::PlatformConfig::with_displays(SocVariant::Mt6985, vec![dual_port_primary()]);
        cfg.platform.tile_overhead = false;
        cfg.platform.timeout_ms = 50;
        let h = Harness::from_config(cfg);
        let disp = h.display(0);
        disp.enable().unwrap();

        let tile = disp.tile();
        assert!(!tile.supported);
        assert_eq!(tile.total(), 0);
        assert_eq!(tile.left_in_width, 720);
    }
}
