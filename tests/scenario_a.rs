//! Single-pipe command-driven bring-up and steady-state frames

mod common;

use std::collections::BTreeSet;

use common::{frame, Harness};
use dpc::cmdq::slots::{read_slot, Slot};
use dpc::cmdq::{ClientId, ClientKind};
use dpc::{
    DisplayConfig, DisplayMode, DpcError, LoopKind, LoopState, PanelConfig, PipeId, SocVariant,
    SyncSource,
};

fn fhd() -> DisplayConfig {
    DisplayConfig::new(0, PanelConfig::new(1920, 1080, 60))
}

mod enable_tests {
    use super::*;

    #[test]
    fn test_major_path_fully_connected() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();

        assert!(disp.is_connected(DisplayMode::Major, PipeId::Pipe0));
        assert!(!disp.is_connected(DisplayMode::Major, PipeId::Pipe1), "single pipe expected");
        assert!(!disp.is_dual());

        let path = disp.path(DisplayMode::Major, PipeId::Pipe0).unwrap();
        let registry = h.subsystem.registry();
        let real: BTreeSet<_> =
            path.comps.iter().copied().filter(|id| !registry.is_virtual(*id)).collect();
        drop(registry);

        let snapshot = disp.snapshot();
        for id in &real {
            assert!(snapshot.links.contains_key(id), "{} not wired", id);
        }
        assert_eq!(disp.mutex_members(), real, "mutex members must equal the real path");
    }

    #[test]
    fn test_one_mutex_command_driven() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();

        assert_eq!(disp.sync_source(), Some(SyncSource::CommandDriven));
        let pool = h.subsystem.mutexes();
        let bound = (0..pool.count()).filter(|m| pool.get(*m).unwrap().display == Some(0)).count();
        assert_eq!(bound, 1, "exactly one mutex for a non-discrete display");
        assert_eq!(disp.reserved_mutex(), None);
    }

    #[test]
    fn test_trigger_loop_running_event_loop_absent() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();

        assert_eq!(disp.loop_state(LoopKind::Trigger), LoopState::Running);
        assert_eq!(disp.loop_state(LoopKind::Event), LoopState::Stopped);
        assert!(h.engine.loop_running(ClientId::new(0, ClientKind::TriggerLoop)));
        assert!(!h.engine.loop_running(ClientId::new(0, ClientKind::EventLoop)));
    }

    #[test]
    fn test_event_loop_when_configured() {
        let mut cfg = fhd();
        cfg.event_loop.enabled = true;
        cfg.event_loop.te_offset_us = 1000;
        let h = Harness::new(SocVariant::Mt6985, vec![cfg]);
        let disp = h.display(0);
        disp.enable().unwrap();
        assert_eq!(disp.loop_state(LoopKind::Event), LoopState::Running);

        h.engine.run_frames(3);
        assert!(h.engine.sleep_ticks() > 0, "event loop never slept");
    }

    #[test]
    fn test_slot_table_zeroed_and_vblank_on() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        h.frame(&disp, &frame(1920, 1080, 1, 9, 400));
        disp.disable().unwrap();

        // Bring-up zeroes whatever the previous session left
        disp.enable().unwrap();
        assert_eq!(read_slot(h.engine.as_ref(), 0, Slot::PresentFence), 0);
        assert_eq!(read_slot(h.engine.as_ref(), 0, Slot::BwRequest), 0);
        disp.wait_idle().unwrap();
        let vblank = h.recorder.vblank.lock().clone();
        assert_eq!(vblank, vec![(0, true), (0, false), (0, true)]);
    }
}

mod frame_tests {
    use super::*;

    #[test]
    fn test_frames_flow_through_trigger_loop() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();

        for n in 1..=5 {
            assert_eq!(h.frame(&disp, &frame(1920, 1080, 2, n, 400)), n as u64);
        }
        disp.wait_idle().unwrap();

        let hw = h.engine.stats(0);
        assert_eq!(hw.triggers, 5);
        assert_eq!(hw.frames, 5);
        let counters = disp.counters();
        assert_eq!(counters.submitted, 5);
        assert_eq!(counters.completed, 5);
        assert_eq!(counters.timeouts, 0);

        assert_eq!(h.recorder.presents(), vec![1, 2, 3, 4, 5]);
        assert_eq!(h.recorder.layer_fences.lock().len(), 10);
        assert_eq!(read_slot(h.engine.as_ref(), 0, Slot::PresentFence), 5);
        assert_eq!(read_slot(h.engine.as_ref(), 0, Slot::TraceStatus), 5);
        assert!(h.recorder.kicks() >= 5, "every commit kicks idle");
    }

    #[test]
    fn test_bandwidth_raise_now_lower_after_completion() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();

        h.frame(&disp, &frame(1920, 1080, 1, 1, 300));
        h.frame(&disp, &frame(1920, 1080, 1, 2, 500));
        assert_eq!(disp.bandwidth(), 500);
        h.frame(&disp, &frame(1920, 1080, 1, 3, 200));
        disp.wait_idle().unwrap();

        assert_eq!(disp.bandwidth(), 200);
        assert_eq!(disp.staged_bandwidth(), None);
        let qos: Vec<u32> = h.recorder.qos.lock().iter().map(|(_, v)| *v).collect();
        assert_eq!(qos, vec![300, 500, 200], "raise on submit, lower on completion");
        assert_eq!(read_slot(h.engine.as_ref(), 0, Slot::BwRequest), 500);
    }

    #[test]
    fn test_rejected_frame_leaves_bandwidth_unchanged() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        h.frame(&disp, &frame(1920, 1080, 1, 1, 300));
        disp.wait_idle().unwrap();

        h.engine.shutdown();
        let err = disp.commit(&frame(1920, 1080, 1, 2, 800)).unwrap_err();
        assert!(matches!(err, DpcError::EngineStopped), "{:?}", err);
        assert_eq!(disp.bandwidth(), 300);
        assert_eq!(h.recorder.last_qos(), Some(300), "raise withdrawn from QoS");

        assert!(disp.commit(&frame(1920, 1080, 1, 3, 100)).is_err());
        assert_eq!(disp.bandwidth(), 300);
        assert_eq!(disp.staged_bandwidth(), None, "no decrease staged for a lost frame");
    }

    #[test]
    fn test_layering_rule_splices_engines() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        assert_eq!(disp.engine_mask(), 0b011);

        *h.recorder.mask.lock() = Some(0b111);
        h.frame(&disp, &frame(1920, 1080, 12, 1, 400));
        assert_eq!(disp.engine_mask(), 0b111);
        assert_eq!(disp.path(DisplayMode::Major, PipeId::Pipe0).unwrap().engines, 3);

        // Refused subset keeps the current one, frame still goes out
        *h.recorder.mask.lock() = Some(0b1000);
        h.frame(&disp, &frame(1920, 1080, 1, 2, 400));
        assert_eq!(disp.engine_mask(), 0b111);
        disp.wait_idle().unwrap();
        assert_eq!(h.recorder.presents(), vec![1, 2]);
    }

    #[test]
    fn test_misconfigured_layer_skipped_frame_completes() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();

        // Layer 11 needs a third engine the default subset lacks
        let mut cfg = frame(1920, 1080, 1, 1, 400);
        let mut far = dpc::LayerConfig::full_screen(11, 1920, 1080);
        far.fence = 1;
        cfg = cfg.with_layer(far);
        h.frame(&disp, &cfg);
        disp.wait_idle().unwrap();
        assert_eq!(disp.counters().completed, 1);
        assert_eq!(h.recorder.presents(), vec![1]);
    }

    #[test]
    fn test_bypass_and_partial_update() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        disp.set_bypass(true).unwrap();
        h.frame(&disp, &frame(1920, 1080, 1, 1, 400).with_roi(dpc::Rect::new(0, 0, 1920, 540)));
        disp.wait_idle().unwrap();
        assert_eq!(disp.counters().completed, 1);

        let registry = h.subsystem.registry();
        let aal = registry.get(dpc::ComponentId::AAL0).unwrap().dump();
        assert!(aal.contains("bypass=true"), "AAL0 state: {}", aal);
    }
}
