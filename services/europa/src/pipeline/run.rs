use std::io;

use super::{PromotedImage, Stage, StageContext};
use crate::context::RegistryContext;
use crate::error::{RegistryError, RegistryResult};

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// The last image produced.
    pub image: PromotedImage,
    /// Component which halted the run.
    pub halted_at: Option<String>,
    /// Error which stopped the run.
    pub error: Option<String>,
    /// Components which ran, in order.
    pub executed: Vec<String>,
}

impl PipelineOutcome {
    /// Every component passed the image on.
    pub fn completed(&self) -> bool {
        self.halted_at.is_none() && self.error.is_none()
    }
}

/// Drives an image through a list of stages.
#[derive(Debug, Clone, Copy)]
pub struct RunPipeline<'a> {
    ctx: &'a RegistryContext,
}

impl<'a> RunPipeline<'a> {
    /// A runner over `ctx`.
    pub fn new(ctx: &'a RegistryContext) -> Self {
        Self { ctx }
    }

    /// Run `stages` in order, starting at the stage with id `start` when given.
    ///
    /// `manually_triggered` applies to the first stage run only. A stage error
    /// stops the run and is reported in the outcome rather than returned.
    pub async fn run<S: Stage>(
        &self,
        stages: &[S],
        image: PromotedImage,
        start: Option<&str>,
        manually_triggered: bool,
    ) -> RegistryResult<PipelineOutcome> {
        let start_index = match start {
            Some(start) => stages
                .iter()
                .position(|stage| stage.id().eq_ignore_ascii_case(start))
                .ok_or(RegistryError::PipelineComponentNotFound)?,
            None => 0,
        };

        let mut outcome = PipelineOutcome {
            image,
            halted_at: None,
            error: None,
            executed: Vec::new(),
        };

        for (index, stage) in stages.iter().enumerate().skip(start_index) {
            let stage_ctx = StageContext {
                registry: self.ctx,
                manually_triggered: manually_triggered && index == start_index,
            };
            outcome.executed.push(stage.id().to_owned());

            match stage.execute(outcome.image.clone(), &stage_ctx).await {
                Ok(Some(next)) => outcome.image = next,
                Ok(None) => {
                    tracing::debug!(stage = stage.id(), "Pipeline halted");
                    outcome.halted_at = Some(stage.id().to_owned());
                    break;
                }
                Err(RegistryError::Io(error)) if error.kind() == io::ErrorKind::Interrupted => {
                    outcome.error = Some(error.to_string());
                    break;
                }
                Err(error) => {
                    tracing::error!(stage = stage.id(), %error, "Pipeline stage failed");
                    outcome.error = Some(error.to_string());
                    break;
                }
            }
        }

        Ok(outcome)
    }
}
