use std::{env, error::Error, time::Duration};

use model::{Metrics, ParameterDict, Tensor};
use ndarray::Array1;
use orchestrator::{Algorithm, Orchestrator, Practitioner, TrainingConfig};
use parameter_server::{EvalError, Evaluator};
use rand::{Rng, SeedableRng, rngs::StdRng};
use worker::{Trainer, TrainerError};

const WEIGHT: f32 = 2.0;
const BIAS: f32 = -1.0;

/// Samples `len` noisy points of the target line.
fn samples(rng: &mut StdRng, len: usize, noise: f32) -> (Array1<f32>, Array1<f32>) {
    let x: Array1<f32> = (0..len).map(|_| rng.random_range(-1.0..1.0)).collect();
    let y = x.mapv(|x| WEIGHT * x + BIAS + rng.random_range(-noise..=noise));
    (x, y)
}

fn to_parameter_dict(weight: f32, bias: f32) -> ParameterDict {
    let mut params = ParameterDict::new();
    params.insert("weight", Tensor::from_elem(vec![1], weight));
    params.insert("bias", Tensor::from_elem(vec![1], bias));
    params
}

fn scalar(params: &ParameterDict, name: &str) -> Option<f32> {
    params.get(name).and_then(|tensor| tensor.iter().next().copied())
}

fn mse(weight: f32, bias: f32, x: &Array1<f32>, y: &Array1<f32>) -> f32 {
    let err = x.mapv(|x| weight * x + bias) - y;
    err.mapv(|e| e * e).mean().unwrap_or_default()
}

struct LinearTrainer {
    weight: f32,
    bias: f32,
    x: Array1<f32>,
    y: Array1<f32>,
    lr: f32,
    epochs: usize,
}

impl Trainer for LinearTrainer {
    fn train_one_round(&mut self) -> Result<(ParameterDict, Metrics), TrainerError> {
        for _ in 0..self.epochs {
            let err = self.x.mapv(|x| self.weight * x + self.bias) - &self.y;
            let grad_w = 2.0 * (&err * &self.x).mean().ok_or("empty dataset")?;
            let grad_b = 2.0 * err.mean().ok_or("empty dataset")?;

            self.weight -= self.lr * grad_w;
            self.bias -= self.lr * grad_b;
        }

        let loss = mse(self.weight, self.bias, &self.x, &self.y);
        Ok((self.parameter_dict(), Metrics::from([("loss".into(), loss as f64)])))
    }

    fn parameter_dict(&self) -> ParameterDict {
        to_parameter_dict(self.weight, self.bias)
    }

    fn set_parameter_dict(&mut self, parameters: ParameterDict) {
        self.weight = scalar(&parameters, "weight").unwrap_or(self.weight);
        self.bias = scalar(&parameters, "bias").unwrap_or(self.bias);
    }

    fn dataset_size(&self) -> usize {
        self.x.len()
    }
}

/// A participant whose samples are `noise` away from the target line.
struct LinearPractitioner {
    id: u64,
    x: Array1<f32>,
    y: Array1<f32>,
}

impl Practitioner for LinearPractitioner {
    fn id(&self) -> u64 {
        self.id
    }

    fn create_trainer(&self) -> Box<dyn Trainer> {
        Box::new(LinearTrainer {
            weight: 0.0,
            bias: 0.0,
            x: self.x.clone(),
            y: self.y.clone(),
            lr: 0.1,
            epochs: 5,
        })
    }
}

/// Reports the loss and the share of predictions within `tolerance`.
struct LinearEvaluator {
    x: Array1<f32>,
    y: Array1<f32>,
    tolerance: f32,
}

impl Evaluator for LinearEvaluator {
    fn evaluate(&mut self, parameters: &ParameterDict) -> Result<Metrics, EvalError> {
        let weight = scalar(parameters, "weight").ok_or("missing weight")?;
        let bias = scalar(parameters, "bias").ok_or("missing bias")?;

        let hits = self
            .x
            .iter()
            .zip(&self.y)
            .filter(|&(x, y)| (weight * x + bias - y).abs() <= self.tolerance)
            .count();

        Ok(Metrics::from([
            ("accuracy".into(), hits as f64 / self.x.len() as f64),
            ("loss".into(), mse(weight, bias, &self.x, &self.y) as f64),
        ]))
    }

    fn parameter_dict(&self) -> ParameterDict {
        to_parameter_dict(0.0, 0.0)
    }
}

fn default_config() -> TrainingConfig {
    let mut config = TrainingConfig::new(4, 10);
    config.algorithm = Algorithm::MultiRoundShapley;
    config.parallel_number = 2;
    config.min_open_files = 64;
    config.seed = Some(42);
    config
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => TrainingConfig::from_json_file(path)?,
        None => default_config(),
    };

    let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or_default());
    let (eval_x, eval_y) = samples(&mut rng, 200, 0.05);

    let mut orchestrator = Orchestrator::new(move || -> Box<dyn Evaluator> {
        Box::new(LinearEvaluator {
            x: eval_x.clone(),
            y: eval_y.clone(),
            tolerance: 0.25,
        })
    });

    // Later practitioners hold noisier data.
    for i in 0..config.worker_number {
        let (x, y) = samples(&mut rng, 50 + 25 * i, 0.1 * (i + 1) as f32);
        orchestrator.add_practitioner(LinearPractitioner {
            id: 100 + i as u64,
            x,
            y,
        });
    }

    let Some(task_id) = orchestrator.train(config, true, None)? else {
        return Ok(());
    };

    let result = loop {
        if let Some(result) = orchestrator.get_training_result(task_id, Some(Duration::from_millis(100)))? {
            break result;
        }

        println!("task {task_id} still training...");
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
