use std::{path::PathBuf, sync::Arc};

use assignd::{
    AssignmentEngine, AssignmentRequest, ExposureEvent, FileSource, GoalRequest, PollerThread,
    Registry, UnitIdentity,
};

pub fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("assignd=info")).init();

    let path = std::env::var("ASSIGND_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("tests/data/experiments.json"));
    let registry = Arc::new(Registry::new());

    // Start a poller thread to keep the registry in sync with the configuration file.
    let poller = PollerThread::start(FileSource::new(path), registry.clone()).unwrap();

    // Block waiting for configuration. Until this call returns, assignments fail with
    // `RegistryUninitialized`.
    poller.wait_for_configuration().unwrap();

    let engine = AssignmentEngine::new(registry)
        .with_event_logger(|event: ExposureEvent| println!("Exposure: {event:?}"));

    let request = AssignmentRequest::new("checkout_redesign", UnitIdentity::user("42"))
        .with_context("country", "US");
    let result = engine.assign(&request).unwrap();
    println!("Assignment: {:?} {:?}", result.decision, result.treatment);

    if let Some(treatment) = result.treatment {
        let goal = engine
            .record_goal(&GoalRequest {
                experiment_id: request.experiment_id,
                treatment,
                goal: "purchase".to_owned(),
                value: Some(19.5),
                unit: request.unit,
                context: request.context,
            })
            .unwrap();
        println!("Goal: {goal:?}");
    }

    poller.shutdown().unwrap();
}
