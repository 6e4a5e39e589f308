//! Ordered phase execution
//!
//! A pipeline is a slice of [`PhaseDescriptor`]s. [`run_phases`] announces
//! each phase, runs it, reports its progress checkpoint, and stops at the
//! first failure. Rolling back is left to the caller, which knows what the
//! failed run managed to create.

use futures::future::BoxFuture;

use rc_protocol::Phase;

use super::emitter::EventSink;
use super::error::DeployError;

/// Future returned by a phase executor
pub type PhaseFuture<'a> = BoxFuture<'a, Result<(), DeployError>>;

/// Executor signature: shared context, mutable run state, the phase being run
pub type PhaseFn<C, S> = for<'a> fn(&'a C, &'a mut S, Phase) -> PhaseFuture<'a>;

/// One entry of a pipeline
pub struct PhaseDescriptor<C, S> {
    pub phase: Phase,
    /// Progress reported once the phase completes
    pub progress: u8,
    pub run: PhaseFn<C, S>,
}

/// A phase that failed, with the error that stopped it
#[derive(Debug)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub error: DeployError,
}

/// Run `pipeline` in order against `ctx` and `state`
pub async fn run_phases<C, S>(
    pipeline: &[PhaseDescriptor<C, S>],
    ctx: &C,
    state: &mut S,
    sink: &EventSink,
) -> Result<(), PhaseFailure>
where
    C: Sync,
    S: Send,
{
    for descriptor in pipeline {
        sink.phase(descriptor.phase);
        tracing::debug!("Running phase {}", descriptor.phase);

        if let Err(error) = (descriptor.run)(ctx, state, descriptor.phase).await {
            tracing::warn!("Phase {} failed: {}", descriptor.phase, error);
            return Err(PhaseFailure {
                phase: descriptor.phase,
                error,
            });
        }
        sink.progress(descriptor.progress);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_core::Redactor;
    use rc_protocol::DeployEvent;

    fn record<'a>(_ctx: &'a (), ran: &'a mut Vec<Phase>, phase: Phase) -> PhaseFuture<'a> {
        Box::pin(async move {
            ran.push(phase);
            Ok(())
        })
    }

    fn fail<'a>(_ctx: &'a (), ran: &'a mut Vec<Phase>, phase: Phase) -> PhaseFuture<'a> {
        Box::pin(async move {
            ran.push(phase);
            Err(DeployError::InvalidInput("boom".to_string()))
        })
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let pipeline: [PhaseDescriptor<(), Vec<Phase>>; 3] = [
            PhaseDescriptor {
                phase: Phase::Keygen,
                progress: 5,
                run: record,
            },
            PhaseDescriptor {
                phase: Phase::SshKey,
                progress: 10,
                run: fail,
            },
            PhaseDescriptor {
                phase: Phase::Provisioning,
                progress: 25,
                run: record,
            },
        ];
        let (sink, mut rx) = EventSink::channel(Redactor::without_secret());
        let mut ran = Vec::new();

        let failure = run_phases(&pipeline, &(), &mut ran, &sink)
            .await
            .unwrap_err();

        assert_eq!(failure.phase, Phase::SshKey);
        assert_eq!(ran, vec![Phase::Keygen, Phase::SshKey]);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(match event {
                DeployEvent::Phase(update) => format!("phase:{}", update.step),
                DeployEvent::Progress(update) => format!("progress:{}", update.percent),
                other => other.name().to_string(),
            });
        }
        assert_eq!(names, vec!["phase:1", "progress:5", "phase:2"]);
    }
}
