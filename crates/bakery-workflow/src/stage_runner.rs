use anyhow::Result;
use thiserror::Error;

pub type StageFn<'a, S> = Box<dyn Fn(&mut S, bool) -> Result<()> + 'a>;

pub struct StageDefinition<'a, S> {
    pub name: &'a str,
    pub run: StageFn<'a, S>,
}

impl<'a, S> StageDefinition<'a, S> {
    pub fn new(name: &'a str, run: impl Fn(&mut S, bool) -> Result<()> + 'a) -> Self {
        Self {
            name,
            run: Box::new(run),
        }
    }
}

pub trait WorkflowState {
    fn is_completed(&self, stage: &str) -> bool;
    fn set_current(&mut self, stage: &str);
    fn mark_completed(&mut self, stage: &str);
}

/// Lifecycle notifications emitted while stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent<'a> {
    Started(&'a str),
    Completed(&'a str),
}

/// The first stage that failed, with its error.
#[derive(Error, Debug)]
#[error("stage '{stage}' failed: {source:#}")]
pub struct StageFailure {
    pub stage: String,
    #[source]
    pub source: anyhow::Error,
}

pub struct StageRunner<'o> {
    dry_run: bool,
    observer: Option<Box<dyn Fn(StageEvent<'_>) + 'o>>,
}

impl<'o> StageRunner<'o> {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: impl Fn(StageEvent<'_>) + 'o) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    fn notify(&self, event: StageEvent<'_>) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }

    /// Run `stages` in order, skipping any the state already marks completed.
    ///
    /// The first failing stage aborts the run; later stages never start.
    pub fn run<S: WorkflowState>(
        &self,
        state: &mut S,
        stages: &[StageDefinition<'_, S>],
    ) -> std::result::Result<(), StageFailure> {
        for stage in stages {
            if state.is_completed(stage.name) {
                continue;
            }
            state.set_current(stage.name);
            log::info!("📍 Starting stage: {}", stage.name);
            self.notify(StageEvent::Started(stage.name));

            (stage.run)(state, self.dry_run).map_err(|source| {
                log::error!("❌ Stage {} failed: {:#}", stage.name, source);
                StageFailure {
                    stage: stage.name.to_string(),
                    source,
                }
            })?;

            state.mark_completed(stage.name);
            log::info!("✅ Completed stage: {}", stage.name);
            self.notify(StageEvent::Completed(stage.name));
        }

        Ok(())
    }
}
