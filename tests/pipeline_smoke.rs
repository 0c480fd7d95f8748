// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Whole-workspace smoke tests: registry-driven construction, the module
//! lifecycle and ordered delivery through the umbrella crate.

use frameflow::inference::{PassthroughLoader, PluginRegistries, TransmitFn};
use frameflow::prelude::*;
use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn detection_frame(stream: u32, pts: u64) -> Arc<Frame> {
    let buffer =
        ArrayD::from_shape_vec(IxDyn(&[1, 6]), vec![1.0, 0.9, 0.1, 0.1, 0.2, 0.2]).unwrap();
    Arc::new(Frame::new(stream, pts, buffer))
}

fn open_params() -> ModuleParams {
    [
        ("model_path", "model.bin"),
        ("function_name", "subnet0"),
        ("postprocessor_name", "detection"),
        ("batch_size", "4"),
        ("batching_timeout", "50"),
    ]
    .into_iter()
    .collect()
}

#[test]
fn registry_drives_the_module_lifecycle() {
    let pool = ModuleIdPool::new();
    let registry = ModuleRegistry::new();
    registry
        .register("Inferencer", |pool, name| {
            Ok(Box::new(Inferencer::with_collaborators(
                pool,
                name,
                Arc::new(PassthroughLoader::lenient()),
                PluginRegistries::with_defaults(),
            )?) as Box<dyn Module>)
        })
        .unwrap();

    let mut module = registry
        .create("Inferencer", "detector0", &pool)
        .expect("registered")
        .expect("constructed");
    assert_eq!(pool.live_count(), 1);
    assert_eq!(module.name(), "detector0");
    assert!(module.base().transmits_self());

    let bus = EventBus::new();
    module.base_mut().attach_events(bus.sender_for("detector0"));
    module.base_mut().add_upstream(0);
    assert_eq!(module.base().upstream_mask(), 1);

    let params = open_params();
    assert!(module.check_params(&params));
    assert!(module.open(&params));
    assert_eq!(module.process(detection_frame(0, 0)), ProcessVerdict::HandledSelf);
    module.process(Arc::new(Frame::eos(0, 1)));
    module.close();

    drop(module);
    assert_eq!(pool.live_count(), 0);
    assert!(bus.is_empty());
}

#[test]
fn concurrent_streams_deliver_in_submission_order() {
    let pool = ModuleIdPool::new();
    let mut inferencer = Inferencer::with_collaborators(
        &pool,
        "detector0",
        Arc::new(PassthroughLoader::lenient()),
        PluginRegistries::with_defaults(),
    )
    .unwrap();

    let delivered: Arc<Mutex<Vec<(u32, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let transmit: TransmitFn = Arc::new(move |frame: Arc<Frame>| {
        sink.lock().push((frame.stream_id(), frame.pts()));
    });
    inferencer.set_transmit(transmit);
    assert!(inferencer.open(&open_params()));

    let module = Arc::new(inferencer);
    let mut producers = Vec::new();
    for stream in 0..2u32 {
        let module = Arc::clone(&module);
        producers.push(thread::spawn(move || {
            for pts in 0..6u64 {
                module.process(detection_frame(stream, pts));
            }
            module.process(Arc::new(Frame::eos(stream, 6)));
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while delivered.lock().len() < 14 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    let delivered = delivered.lock().clone();
    assert_eq!(delivered.len(), 14);
    for stream in 0..2u32 {
        let pts: Vec<u64> = delivered
            .iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, p)| *p)
            .collect();
        assert_eq!(pts, (0..7).collect::<Vec<_>>());
    }

    let mut module =
        Arc::try_unwrap(module).unwrap_or_else(|_| panic!("producers still hold module"));
    module.close();
    assert_eq!(module.active_contexts(), 0);
}
