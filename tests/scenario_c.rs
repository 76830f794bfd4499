//! Stalled hardware: timeout, diagnostics and recovery

mod common;

use std::collections::BTreeSet;

use common::{frame, Harness};
use serial_test::serial;

use dpc::{diag, DisplayConfig, DisplayMode, DpcError, LoopKind, LoopState, PanelConfig, SocVariant};

fn fhd() -> DisplayConfig {
    DisplayConfig::new(0, PanelConfig::new(1920, 1080, 60))
}

mod command_stall_tests {
    use super::*;

    #[test]
    #[serial]
    fn test_stalled_frame_recovered_on_next_commit() {
        diag::clear_history();
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        h.frame(&disp, &frame(1920, 1080, 1, 1, 300));
        let wiring = disp.snapshot();
        let members = disp.mutex_members();

        // Frame 2 is triggered but never reaches end of frame
        h.engine.set_stall(0, true);
        h.frame(&disp, &frame(1920, 1080, 1, 2, 300));
        // Frame 3 queues behind it
        assert_eq!(disp.commit(&frame(1920, 1080, 1, 3, 300)).unwrap(), 3);
        // Frame 4 finds the config client stuck
        assert_eq!(disp.commit(&frame(1920, 1080, 1, 4, 300)).unwrap(), 4);

        let counters = disp.counters();
        assert_eq!(counters.timeouts, 1);
        assert_eq!(counters.recoveries, 1);
        assert_eq!(counters.aborted, 1, "frame 3 dropped by the abort");
        assert_eq!(disp.loop_state(LoopKind::Trigger), LoopState::Running);

        h.engine.set_stall(0, false);
        h.engine.tick();
        h.frame(&disp, &frame(1920, 1080, 1, 5, 300));
        disp.wait_idle().unwrap();

        assert_eq!(disp.snapshot(), wiring, "recovery rewires the same path");
        assert_eq!(disp.mutex_members(), members);
        assert_eq!(disp.counters().completed, 4);
        let presents: BTreeSet<u32> = h.recorder.presents().into_iter().collect();
        assert_eq!(presents, (1..=5).collect(), "aborted frames still release their fences");

        let dumps = diag::history_for(0);
        assert!(!dumps.is_empty(), "timeout must leave a diagnostic report");
        assert!(dumps[0].reason.contains("timed out"), "reason: {}", dumps[0].reason);
        assert!(!dumps[0].mutex_members.is_empty());
    }

    #[test]
    #[serial]
    fn test_timeout_during_mode_switch_still_switches() {
        diag::clear_history();
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        h.frame(&disp, &frame(1920, 1080, 1, 1, 300));

        h.engine.set_stall(0, true);
        h.frame(&disp, &frame(1920, 1080, 1, 2, 300));
        disp.commit(&frame(1920, 1080, 1, 3, 300)).unwrap();

        disp.request_mode(DisplayMode::Minor as u32).unwrap();
        assert_eq!(disp.mode(), DisplayMode::Minor);
        assert_eq!(disp.counters().timeouts, 1);
        assert!(!diag::history_for(0).is_empty());
        assert_eq!(disp.loop_state(LoopKind::Trigger), LoopState::Running);

        h.engine.set_stall(0, false);
        h.frame(&disp, &frame(1920, 1080, 1, 4, 300));
        disp.wait_idle().unwrap();
        assert!(h.recorder.presents().contains(&4));
    }

    #[test]
    #[serial]
    fn test_idle_wait_reports_timeout() {
        diag::clear_history();
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        h.frame(&disp, &frame(1920, 1080, 1, 1, 300));

        h.engine.set_stall(0, true);
        h.frame(&disp, &frame(1920, 1080, 1, 2, 300));
        disp.commit(&frame(1920, 1080, 1, 3, 300)).unwrap();

        let err = disp.wait_idle().unwrap_err();
        assert!(matches!(err, DpcError::Timeout { .. }), "got {:?}", err);
        assert_eq!(disp.counters().recoveries, 1);

        h.engine.set_stall(0, false);
        h.frame(&disp, &frame(1920, 1080, 1, 4, 300));
        disp.wait_idle().unwrap();
    }
}

mod continuous_stall_tests {
    use super::*;

    #[test]
    #[serial]
    fn test_stalled_stream_restarted() {
        diag::clear_history();
        let ext = DisplayConfig::new(1, PanelConfig::new(1920, 1080, 60).video_mode());
        let h = Harness::new(SocVariant::Mt6985, vec![ext]);
        let disp = h.display(1);
        disp.enable().unwrap();
        h.frame(&disp, &frame(1920, 1080, 1, 1, 300));

        h.engine.set_stall(1, true);
        disp.commit(&frame(1920, 1080, 1, 2, 300)).unwrap();
        h.engine.tick();
        disp.commit(&frame(1920, 1080, 1, 3, 300)).unwrap();

        let counters = disp.counters();
        assert_eq!(counters.timeouts, 1);
        assert_eq!(counters.recoveries, 1);
        assert!(h.engine.is_streaming(1), "recovery re-triggers the stream");

        h.engine.set_stall(1, false);
        h.engine.tick();
        disp.wait_idle().unwrap();
        assert_eq!(disp.counters().completed, 2);
        assert_eq!(diag::history_for(1).len(), 1);
        assert!(diag::history_for(0).is_empty());
    }
}

mod explicit_recovery_tests {
    use super::*;

    #[test]
    #[serial]
    fn test_recover_healthy_display() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        disp.enable().unwrap();
        h.frame(&disp, &frame(1920, 1080, 2, 1, 450));
        let wiring = disp.snapshot();

        disp.recover().unwrap();
        let counters = disp.counters();
        assert_eq!(counters.recoveries, 1);
        assert_eq!(counters.timeouts, 0);
        assert_eq!(disp.snapshot(), wiring);
        assert_eq!(h.recorder.last_qos(), Some(450), "bandwidth restored after reset");

        h.frame(&disp, &frame(1920, 1080, 2, 2, 450));
        disp.wait_idle().unwrap();
        assert_eq!(h.recorder.presents(), vec![1, 2]);
    }

    #[test]
    #[serial]
    fn test_recover_disabled_display_refused() {
        let h = Harness::new(SocVariant::Mt6985, vec![fhd()]);
        let disp = h.display(0);
        let err = disp.recover().unwrap_err();
        assert!(matches!(err, DpcError::NotEnabled(0)), "got {:?}", err);
    }
}
