//! Windowed runs on a real device with a stand-in viewer.
//!
//! The viewer records every slot change it sees through the volume swap and
//! closes once both the reader and the writer have moved at least twice.
//! Tests return early when no GPU adapter is available.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use compute::gpu::{Context, FieldBufferSet};
use compute::{gpu_available, SwapPhase};
use orchestrator::{FrameControl, Simulation, SimulationParameters, Viewer};

const DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Observed {
    frames: u64,
    read_moves: u32,
    write_moves: u32,
    phases: Vec<SwapPhase>,
    attached: bool,
    detached: bool,
}

struct CountingViewer {
    observed: Arc<Mutex<Observed>>,
    last: Option<(usize, usize)>,
    started: Option<Instant>,
}

impl Viewer for CountingViewer {
    fn attach(&mut self, _context: &Arc<Context>, volumes: &Arc<FieldBufferSet>) -> Result<(), String> {
        let state = volumes.state();
        self.last = Some((state.read_idx(), state.write_idx()));
        self.started = Some(Instant::now());
        self.observed.lock().unwrap().attached = true;
        Ok(())
    }

    fn frame(&mut self, volumes: &FieldBufferSet) -> Result<FrameControl, String> {
        let state = volumes.state();
        let mut observed = self.observed.lock().unwrap();
        observed.frames += 1;
        observed.phases.push(state.phase());
        if let Some((read, write)) = self.last {
            if state.read_idx() != read {
                observed.read_moves += 1;
            }
            if state.write_idx() != write {
                observed.write_moves += 1;
            }
        }
        self.last = Some((state.read_idx(), state.write_idx()));

        let enough = observed.read_moves >= 2 && observed.write_moves >= 2;
        let expired = self.started.is_some_and(|t| t.elapsed() > DEADLINE);
        drop(observed);
        if enough || expired {
            return Ok(FrameControl::Quit);
        }
        thread::sleep(Duration::from_millis(1));
        Ok(FrameControl::Continue)
    }

    fn detach(&mut self) {
        self.observed.lock().unwrap().detached = true;
    }
}

#[test]
fn test_viewer_sees_reader_and_writer_advance() {
    if !gpu_available() {
        eprintln!("Skipping: no GPU adapter available");
        return;
    }

    let observed = Arc::new(Mutex::new(Observed::default()));
    let viewer = CountingViewer {
        observed: Arc::clone(&observed),
        last: None,
        started: None,
    };
    let simulation = Simulation::with_viewer(Box::new(viewer));

    let summary = simulation.run(SimulationParameters::with_grid(10, 10, 10)).unwrap();
    assert!(summary.timesteps >= 1);
    assert!(!simulation.is_running());

    let observed = observed.lock().unwrap();
    assert!(observed.attached);
    assert!(observed.detached);
    assert!(observed.read_moves >= 2, "reader moved {} times in {} frames", observed.read_moves, observed.frames);
    assert!(observed.write_moves >= 2, "writer moved {} times in {} frames", observed.write_moves, observed.frames);
    assert!(observed.phases.iter().any(|&p| p == SwapPhase::ReadingNew));
}

#[test]
fn test_viewer_quit_stops_run() {
    if !gpu_available() {
        eprintln!("Skipping: no GPU adapter available");
        return;
    }

    struct QuitAfter {
        frames: u32,
        detached: Arc<AtomicBool>,
    }
    impl Viewer for QuitAfter {
        fn attach(&mut self, _: &Arc<Context>, _: &Arc<FieldBufferSet>) -> Result<(), String> {
            Ok(())
        }
        fn frame(&mut self, _: &FieldBufferSet) -> Result<FrameControl, String> {
            self.frames += 1;
            thread::sleep(Duration::from_millis(1));
            Ok(if self.frames >= 20 { FrameControl::Quit } else { FrameControl::Continue })
        }
        fn detach(&mut self) {
            self.detached.store(true, Ordering::SeqCst);
        }
        fn frames_in_flight(&self) -> u32 {
            1
        }
    }

    let detached = Arc::new(AtomicBool::new(false));
    let simulation = Simulation::with_viewer(Box::new(QuitAfter {
        frames: 0,
        detached: Arc::clone(&detached),
    }));

    // Without the viewer closing, this run has no end.
    let summary = simulation.run(SimulationParameters::with_grid(10, 10, 10)).unwrap();
    assert!(summary.timesteps >= 1);
    assert!(detached.load(Ordering::SeqCst));
}
