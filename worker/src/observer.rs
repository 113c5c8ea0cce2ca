use longshore_bundle::RunStage;

/// Invoked on every run-stage transition; deployments hang metrics or
/// profiling off this. The default does nothing.
pub trait StageObserver: Send + Sync {
    fn on_transition(&self, uuid: &str, from: RunStage, to: RunStage);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl StageObserver for NoopObserver {
    fn on_transition(&self, _uuid: &str, _from: RunStage, _to: RunStage) {}
}
