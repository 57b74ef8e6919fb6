use parameter_server::Evaluator;
use worker::Trainer;

/// A participant of the federation, owner of a local dataset.
pub trait Practitioner: Send + Sync {
    /// The caller facing id, unique within an orchestrator.
    fn id(&self) -> u64;

    /// Creates a fresh trainer over this practitioner's data.
    fn create_trainer(&self) -> Box<dyn Trainer>;
}

/// Creates the server side evaluator of every task.
pub trait EvaluatorFactory: Send + Sync {
    fn create_evaluator(&self) -> Box<dyn Evaluator>;
}

impl<F> EvaluatorFactory for F
where
    F: Fn() -> Box<dyn Evaluator> + Send + Sync,
{
    fn create_evaluator(&self) -> Box<dyn Evaluator> {
        self()
    }
}
