// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end behavior of the inference stage: ordering, EOS bypass and
//! batch-failure recovery across the engine and delivery path.

use frameflow_core::{EventBus, EventKind, Frame, Module, ModuleIdPool, ModuleParams, ProcessVerdict};
use frameflow_inference::{
    Inferencer, ModelLoader, ModelRunner, PassthroughLoader, PluginRegistries, RunnerConfig,
    RunnerError, TensorInput, TensorOutput, TransmitFn,
};
use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn detection_frame(stream_id: u32, pts: u64) -> Arc<Frame> {
    let buffer =
        ArrayD::from_shape_vec(IxDyn(&[1, 6]), vec![1.0, 0.9, 0.1, 0.1, 0.2, 0.2]).unwrap();
    Arc::new(Frame::new(stream_id, pts, buffer))
}

fn params(extra: &[(&str, &str)]) -> ModuleParams {
    let mut params: ModuleParams = [
        ("model_path", "model.bin"),
        ("function_name", "subnet0"),
        ("postprocessor_name", "detection"),
    ]
    .into_iter()
    .collect();
    for (k, v) in extra {
        params.insert(*k, *v);
    }
    params
}

fn collecting_transmit() -> (TransmitFn, Arc<Mutex<Vec<Arc<Frame>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let transmit: TransmitFn = Arc::new(move |frame: Arc<Frame>| {
        sink.lock().push(frame);
    });
    (transmit, seen)
}

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(10));
    }
}

fn lenient_inferencer(pool: &Arc<ModuleIdPool>, name: &str) -> Inferencer {
    Inferencer::with_collaborators(
        pool,
        name,
        Arc::new(PassthroughLoader::lenient()),
        PluginRegistries::with_defaults(),
    )
    .unwrap()
}

#[test]
fn per_thread_delivery_order_matches_submission_order() {
    let pool = ModuleIdPool::new();
    let mut module = lenient_inferencer(&pool, "detector");
    let (transmit, seen) = collecting_transmit();
    module.set_transmit(transmit);
    assert!(module.open(&params(&[("batch_size", "4"), ("batching_timeout", "50")])));

    const STREAMS: u32 = 3;
    const FRAMES: u64 = 10;
    let module = Arc::new(module);
    let mut producers = Vec::new();
    for stream in 0..STREAMS {
        let module = Arc::clone(&module);
        producers.push(thread::spawn(move || {
            for pts in 0..FRAMES {
                let verdict = module.process(detection_frame(stream, pts));
                assert_eq!(verdict, ProcessVerdict::HandledSelf);
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    wait_for(|| seen.lock().len() == (STREAMS as usize) * (FRAMES as usize));
    assert_eq!(module.active_contexts(), STREAMS as usize);

    // Interleaving across streams is arbitrary; within each stream the
    // delivery order must equal submission order with nothing lost.
    let delivered = seen.lock();
    for stream in 0..STREAMS {
        let pts_order: Vec<u64> = delivered
            .iter()
            .filter(|f| f.stream_id() == stream)
            .map(|f| f.pts())
            .collect();
        assert_eq!(pts_order, (0..FRAMES).collect::<Vec<_>>());
    }
    drop(delivered);

    let mut module = Arc::try_unwrap(module).unwrap_or_else(|_| panic!("producers still hold module"));
    module.close();
    assert_eq!(module.active_contexts(), 0);
}

#[test]
fn eos_bypasses_batching_and_preserves_order() {
    let pool = ModuleIdPool::new();
    let mut module = lenient_inferencer(&pool, "detector");
    let (transmit, seen) = collecting_transmit();
    module.set_transmit(transmit);
    assert!(module.open(&params(&[
        ("batch_size", "2"),
        // Effectively infinite; only full batches dispatch.
        ("batching_timeout", "3600000"),
    ])));

    // A full batch ahead of the EOS keeps its place in line.
    module.process(detection_frame(7, 0));
    module.process(detection_frame(7, 1));
    module.process(Arc::new(Frame::eos(7, 2)));

    wait_for(|| seen.lock().len() == 3);
    let delivered: Vec<u64> = seen.lock().iter().map(|f| f.pts()).collect();
    assert_eq!(delivered, vec![0, 1, 2]);
    assert!(seen.lock()[2].is_eos());
    module.close();
}

#[test]
fn lone_eos_is_delivered_without_batching_delay() {
    let pool = ModuleIdPool::new();
    let mut module = lenient_inferencer(&pool, "detector");
    let (transmit, seen) = collecting_transmit();
    module.set_transmit(transmit);
    assert!(module.open(&params(&[
        ("batch_size", "8"),
        ("batching_timeout", "3600000"),
    ])));

    module.process(Arc::new(Frame::eos(0, 0)));
    // Arrives well before any batch could fill or time out.
    wait_for(|| seen.lock().len() == 1);
    assert!(seen.lock()[0].is_eos());
    module.close();
}

#[test]
fn dropped_frames_pass_through_without_inference() {
    let pool = ModuleIdPool::new();
    let mut module = lenient_inferencer(&pool, "detector");
    let (transmit, seen) = collecting_transmit();
    module.set_transmit(transmit);
    assert!(module.open(&params(&[
        ("batch_size", "2"),
        ("batching_timeout", "50"),
        ("infer_interval", "3"),
    ])));

    for pts in 0..10u64 {
        module.process(detection_frame(0, pts));
    }
    wait_for(|| seen.lock().len() == 10);

    // Positions 0, 3, 6, 9 bypass inference: no detections attached.
    let delivered = seen.lock();
    for frame in delivered.iter() {
        let inferred = !frame.objects().is_empty();
        let expected_drop = frame.pts() % 3 == 0;
        assert_eq!(inferred, !expected_drop, "pts {}", frame.pts());
    }
    assert_eq!(
        delivered.iter().map(|f| f.pts()).collect::<Vec<_>>(),
        (0..10).collect::<Vec<_>>()
    );
    drop(delivered);
    module.close();
}

/// Loader whose runner fails exactly one batch on request.
struct FailOnceRunner {
    fail_next: AtomicBool,
}

impl ModelRunner for FailOnceRunner {
    fn run(&self, batch: &[TensorInput]) -> Result<Vec<TensorOutput>, RunnerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RunnerError::Execution("simulated device fault".into()));
        }
        Ok(batch.to_vec())
    }
}

struct FailOnceLoader {
    runner: Arc<FailOnceRunner>,
}

impl ModelLoader for FailOnceLoader {
    fn load(&self, _config: &RunnerConfig) -> Result<Arc<dyn ModelRunner>, RunnerError> {
        Ok(Arc::clone(&self.runner) as Arc<dyn ModelRunner>)
    }
}

#[test]
fn failed_batch_marks_frames_posts_one_event_and_recovers() {
    let pool = ModuleIdPool::new();
    let runner = Arc::new(FailOnceRunner {
        fail_next: AtomicBool::new(false),
    });
    let mut module = Inferencer::with_collaborators(
        &pool,
        "detector",
        Arc::new(FailOnceLoader {
            runner: Arc::clone(&runner),
        }),
        PluginRegistries::with_defaults(),
    )
    .unwrap();

    let bus = EventBus::new();
    module.base_mut().attach_events(bus.sender_for("detector"));
    let (transmit, seen) = collecting_transmit();
    module.set_transmit(transmit);
    assert!(module.open(&params(&[("batch_size", "2"), ("batching_timeout", "3600000")])));

    runner.fail_next.store(true, Ordering::SeqCst);
    module.process(detection_frame(0, 0));
    module.process(detection_frame(0, 1));
    wait_for(|| seen.lock().len() == 2);

    {
        let delivered = seen.lock();
        assert!(delivered.iter().all(|f| f.infer_error().is_some()));
    }
    let event = bus.try_poll().expect("error event posted");
    assert_eq!(event.kind, EventKind::Error);
    assert!(bus.try_poll().is_none(), "exactly one event per failed batch");

    // The same context keeps working on the next batch.
    module.process(detection_frame(0, 2));
    module.process(detection_frame(0, 3));
    wait_for(|| seen.lock().len() == 4);
    {
        let delivered = seen.lock();
        assert!(delivered[2].infer_error().is_none());
        assert!(delivered[3].infer_error().is_none());
        assert_eq!(
            delivered.iter().map(|f| f.pts()).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }
    module.close();
}
