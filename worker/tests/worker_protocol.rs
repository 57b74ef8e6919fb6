use std::{
    env, fs,
    num::NonZeroUsize,
    path::Path,
    sync::{Arc, Mutex},
};

use comms::{
    ClientEndpoint, CommsErr, DeviceLock, ServerEndpoint, Topology,
    msg::{Payload, RoundResult, Upload},
};
use model::{Metrics, ModelCache, ParameterDict, Tensor};
use worker::{Dropout, Trainer, TrainerError, Worker, WorkerBuilder, WorkerErr, WorkerState};

/// Adds `step` to every parameter each round.
struct TestTrainer {
    params: ParameterDict,
    step: f32,
    dataset_size: usize,
    received: Arc<Mutex<Vec<ParameterDict>>>,
    device_lock: Option<DeviceLock>,
    fail: bool,
}

impl TestTrainer {
    fn new(len: usize, step: f32) -> Self {
        Self {
            params: filled(len, 0.0),
            step,
            dataset_size: 10,
            received: Arc::default(),
            device_lock: None,
            fail: false,
        }
    }
}

impl Trainer for TestTrainer {
    fn train_one_round(&mut self) -> Result<(ParameterDict, Metrics), TrainerError> {
        if self.fail {
            return Err("out of memory".into());
        }

        if let Some(lock) = &self.device_lock {
            assert!(lock.is_locked());
        }

        for (_, tensor) in self.params.iter_mut() {
            *tensor += self.step;
        }

        let metrics = Metrics::from([("loss".to_string(), 0.5)]);
        Ok((self.params.clone(), metrics))
    }

    fn parameter_dict(&self) -> ParameterDict {
        self.params.clone()
    }

    fn set_parameter_dict(&mut self, parameters: ParameterDict) {
        self.received.lock().unwrap().push(parameters.clone());
        self.params = parameters;
    }

    fn dataset_size(&self) -> usize {
        self.dataset_size
    }
}

fn filled(len: usize, value: f32) -> ParameterDict {
    let mut params = ParameterDict::new();
    params.insert("w", Tensor::from_elem(vec![len], value));
    params
}

fn setup() -> (ServerEndpoint, ClientEndpoint) {
    let topology = Arc::new(Topology::new(1, NonZeroUsize::new(8).unwrap()));
    let server = ServerEndpoint::new(Arc::clone(&topology));
    let client = ClientEndpoint::new(topology, 0).unwrap();
    (server, client)
}

fn parameter(params: ParameterDict, round_number: u64) -> RoundResult {
    RoundResult::Parameter {
        parameter: Arc::new(params),
        round_number,
    }
}

fn expect_update(upload: Upload) -> (Payload, usize, u64) {
    match upload {
        Upload::Update(msg) => (msg.payload, msg.dataset_size, msg.round_number),
        Upload::Skip { round_number } => panic!("unexpected skip for round {round_number}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_worker_sends_diff_against_received_parameters() {
    let (server, client) = setup();
    let trainer = TestTrainer::new(3, 1.0);
    let received = Arc::clone(&trainer.received);

    let worker = WorkerBuilder::new(client, Box::new(trainer))
        .distribute_init_parameters(true)
        .build();

    let server_side = async {
        server.send(parameter(filled(3, 2.0), 1), 0).await.unwrap();

        let (payload, dataset_size, round_number) = expect_update(server.get(0).await.unwrap());
        assert_eq!(round_number, 1);
        assert_eq!(dataset_size, 10);
        match payload {
            Payload::ParameterDiff(diff) => assert!(diff.approx_eq(&filled(3, 1.0), 1e-6)),
            Payload::Parameter(_) => panic!("expected a diff"),
        }

        server.send(parameter(filled(3, 5.0), 2), 0).await.unwrap();
        let (payload, _, round_number) = expect_update(server.get(0).await.unwrap());
        assert_eq!(round_number, 2);
        assert!(payload.parameters().approx_eq(&filled(3, 1.0), 1e-6));

        server.send(RoundResult::EndTraining, 0).await.unwrap();
        server.wait_close().await.unwrap()
    };

    let (metrics, discarded) = tokio::join!(worker.run(), server_side);
    let metrics = metrics.unwrap();

    assert_eq!(discarded, 0);
    assert_eq!(metrics.rounds_trained, 2);
    assert_eq!(metrics.rounds_skipped, 0);
    assert_eq!(metrics.bandwidth_ratio(), 1.0);
    assert_eq!(metrics.last_train_metrics.get("loss"), Some(&0.5));
    assert_eq!(*received.lock().unwrap(), vec![filled(3, 2.0), filled(3, 5.0)]);
}

fn cache_files(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test(flavor = "current_thread")]
async fn test_worker_keeps_a_single_baseline_across_rounds() {
    let (server, client) = setup();
    let dir = env::temp_dir().join(format!("worker-cache-{}", uuid::Uuid::new_v4()));

    let mut worker = WorkerBuilder::new(client, Box::new(TestTrainer::new(3, 1.0)))
        .cache(ModelCache::new(None, Some(dir.clone())))
        .distribute_init_parameters(true)
        .build();

    for round in 1..=20 {
        server.send(parameter(filled(3, round as f32), round), 0).await.unwrap();

        worker.step().await.unwrap();
        worker.step().await.unwrap();
        worker.step().await.unwrap();

        let (payload, _, round_number) = expect_update(server.get(0).await.unwrap());
        assert_eq!(round_number, round);
        match payload {
            Payload::ParameterDiff(diff) => assert!(diff.approx_eq(&filled(3, 1.0), 1e-6)),
            Payload::Parameter(_) => panic!("expected a diff"),
        }
        assert_eq!(cache_files(&dir), 1, "round {round}");
    }

    server.send(RoundResult::EndTraining, 0).await.unwrap();
    worker.step().await.unwrap();
    assert!(matches!(worker.state(), WorkerState::Stopped));
    assert_eq!(worker.metrics().rounds_trained, 20);

    fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn test_worker_cache_is_removed_after_training() {
    let (server, client) = setup();
    let dir = env::temp_dir().join(format!("worker-cache-{}", uuid::Uuid::new_v4()));

    let worker = WorkerBuilder::new(client, Box::new(TestTrainer::new(2, 0.5)))
        .cache(ModelCache::new(None, Some(dir.clone())))
        .distribute_init_parameters(true)
        .build();

    let server_side = async {
        for round in 1..=5 {
            server.send(parameter(filled(2, 0.0), round), 0).await.unwrap();
            expect_update(server.get(0).await.unwrap());
            assert!(cache_files(&dir) <= 1);
        }
        server.send(RoundResult::EndTraining, 0).await.unwrap();
        server.wait_close().await.unwrap()
    };

    let (metrics, discarded) = tokio::join!(worker.run(), server_side);
    assert_eq!(metrics.unwrap().rounds_trained, 5);
    assert_eq!(discarded, 0);
    assert_eq!(cache_files(&dir), 0);
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "current_thread")]
async fn test_skipped_rounds_advance_the_round_counter() {
    let (server, client) = setup();
    let mut worker = WorkerBuilder::new(client, Box::new(TestTrainer::new(2, 1.0)))
        .distribute_init_parameters(true)
        .build();

    server.send(RoundResult::Skip, 0).await.unwrap();
    server.send(parameter(filled(2, 9.0), 7), 0).await.unwrap();
    server.send(RoundResult::Skip, 0).await.unwrap();
    server.send(parameter(filled(2, 4.0), 4), 0).await.unwrap();

    worker.step().await.unwrap();

    assert!(matches!(worker.state(), WorkerState::Training));
    assert_eq!(worker.round_number(), 4);
    assert_eq!(worker.metrics().rounds_skipped, 3);
    assert_eq!(worker.trainer().parameter_dict(), filled(2, 4.0));

    for expected in 1..=3 {
        match server.get(0).await.unwrap() {
            Upload::Skip { round_number } => assert_eq!(round_number, expected),
            Upload::Update(_) => panic!("expected a skip"),
        }
    }

    worker.step().await.unwrap();
    worker.step().await.unwrap();

    let (_, _, round_number) = expect_update(server.get(0).await.unwrap());
    assert_eq!(round_number, 4);
    assert!(matches!(worker.state(), WorkerState::AwaitingAggregate));
    assert_eq!(worker.round_number(), 5);
}

#[tokio::test(flavor = "current_thread")]
async fn test_worker_without_baseline_sends_full_parameters() {
    let (server, client) = setup();
    let worker = WorkerBuilder::new(client, Box::new(TestTrainer::new(4, 0.5))).build();

    let server_side = async {
        let (payload, _, round_number) = expect_update(server.get(0).await.unwrap());
        assert_eq!(round_number, 1);
        match payload {
            Payload::Parameter(params) => assert!(params.approx_eq(&filled(4, 0.5), 1e-6)),
            Payload::ParameterDiff(_) => panic!("expected full parameters"),
        }

        server.send(RoundResult::EndTraining, 0).await.unwrap();
        server.wait_close().await.unwrap();
    };

    let (metrics, ()) = tokio::join!(worker.run(), server_side);
    assert_eq!(metrics.unwrap().rounds_trained, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn test_dropout_reduces_sent_elements() {
    let (server, client) = setup();
    let dropout = Dropout::new(0.5, Some(42)).unwrap();

    let worker = WorkerBuilder::new(client, Box::new(TestTrainer::new(1_000, 1.0)))
        .sparsifier(Box::new(dropout))
        .distribute_init_parameters(true)
        .build();

    let server_side = async {
        server.send(parameter(filled(1_000, 0.0), 1), 0).await.unwrap();

        let (payload, _, _) = expect_update(server.get(0).await.unwrap());
        let kept = payload.parameters().count_nonzero();
        assert!((300..700).contains(&kept), "kept {kept}");

        server.send(RoundResult::EndTraining, 0).await.unwrap();
        server.wait_close().await.unwrap();
        kept
    };

    let (metrics, kept) = tokio::join!(worker.run(), server_side);
    let metrics = metrics.unwrap();

    assert_eq!(metrics.sent_elements, kept as u64);
    assert_eq!(metrics.total_elements, 1_000);
    assert!(metrics.bandwidth_ratio() < 1.0);
}

#[tokio::test(flavor = "current_thread")]
async fn test_device_lock_is_held_while_training() {
    let (server, client) = setup();
    let device_lock = comms::device_lock();

    let mut trainer = TestTrainer::new(2, 1.0);
    trainer.device_lock = Some(Arc::clone(&device_lock));

    let worker = WorkerBuilder::new(client, Box::new(trainer))
        .device_lock(Arc::clone(&device_lock))
        .build();

    let server_side = async {
        server.get(0).await.unwrap();
        assert!(!device_lock.is_locked());
        server.send(RoundResult::EndTraining, 0).await.unwrap();
    };

    let (metrics, ()) = tokio::join!(worker.run(), server_side);
    assert!(metrics.is_ok());
    assert!(!device_lock.is_locked());
}

#[tokio::test(flavor = "current_thread")]
async fn test_trainer_failure_closes_the_worker_channels() {
    let (server, client) = setup();
    let mut trainer = TestTrainer::new(2, 1.0);
    trainer.fail = true;

    let worker = WorkerBuilder::new(client, Box::new(trainer)).build();

    let res = worker.run().await;
    assert!(matches!(res, Err(WorkerErr::Trainer(_))));

    assert!(matches!(
        server.get(0).await,
        Err(CommsErr::Transport { worker_id: 0, .. })
    ));
    assert_eq!(server.wait_close().await.unwrap(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn test_step_after_stop_is_a_noop() {
    let (server, client) = setup();
    let mut worker: Worker = WorkerBuilder::new(client, Box::new(TestTrainer::new(1, 1.0)))
        .distribute_init_parameters(true)
        .build();

    server.send(RoundResult::EndTraining, 0).await.unwrap();

    worker.step().await.unwrap();
    assert!(matches!(worker.state(), WorkerState::Stopped));

    worker.step().await.unwrap();
    assert!(matches!(worker.state(), WorkerState::Stopped));
    assert_eq!(worker.round_number(), 1);
}
