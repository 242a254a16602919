//! Stage trait and the worker loop that hosts one stage on its own thread.

use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use crossbeam_channel::Sender;

use crate::monitor::{Monitor, PipelineEvent};
use crate::queue::{LinkRecvError, LinkReceiver, LinkSendError, LinkSender, StopTrigger};

/// Why a stage could not process an item.
#[derive(Debug)]
pub enum StageError {
    /// This item is unusable; skip it and keep running.
    Item(anyhow::Error),
    /// The stage can no longer run at all; the pipeline must stop.
    Fatal(anyhow::Error),
}

impl StageError {
    pub fn item(msg: impl Into<String>) -> Self {
        StageError::Item(anyhow!(msg.into()))
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        StageError::Fatal(anyhow!(msg.into()))
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageError::Item(e) => write!(f, "item error: {e}"),
            StageError::Fatal(e) => write!(f, "fatal error: {e}"),
        }
    }
}

/// One processing step. Exactly one worker thread drives each instance, so
/// implementations can hold mutable state without synchronization.
///
/// A stage may emit zero outputs (a filter), one (the common case), or many
/// (a fan-out such as re-batching).
pub trait Stage<I, O>: Send {
    fn name(&self) -> &str;

    fn process(&mut self, input: I) -> Result<Vec<O>, StageError>;

    /// One-time setup on the worker thread before the first item. A failure
    /// here is fatal to the pipeline.
    fn warm_up(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// Fatal-error report delivered to the pipeline control handle.
pub struct FatalReport {
    pub stage: String,
    pub error: anyhow::Error,
}

/// Spawn the worker loop for `stage` between two links.
///
/// The loop exits when the input link closes (end of stream cascades by
/// dropping the output sender), when the stop token wakes it, or on a fatal
/// stage error, which fires the stop trigger itself so the rest of the graph
/// unwinds.
pub fn spawn_stage<I, O, S>(
    mut stage: S,
    input: LinkReceiver<I>,
    output: LinkSender<O>,
    stop: StopTrigger,
    fatal_tx: Sender<FatalReport>,
    monitor: Monitor,
) -> JoinHandle<()>
where
    I: Send + 'static,
    O: Send + 'static,
    S: Stage<I, O> + 'static,
{
    let name = stage.name().to_string();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if let Err(err) = stage.warm_up() {
                let err = match err {
                    StageError::Item(e) | StageError::Fatal(e) => e,
                };
                report_fatal(&name, err, &stop, &fatal_tx);
                return;
            }
            loop {
                let item = match input.recv() {
                    Ok(item) => item,
                    Err(LinkRecvError::Closed) => {
                        log::debug!("stage {name}: input closed, draining out");
                        break;
                    }
                    Err(LinkRecvError::Stopped) => break,
                };
                match stage.process(item) {
                    Ok(outputs) => {
                        for out in outputs {
                            match output.send(out) {
                                Ok(_) => {}
                                Err(LinkSendError::Stopped)
                                | Err(LinkSendError::Disconnected) => return,
                            }
                        }
                    }
                    Err(StageError::Item(e)) => {
                        monitor.report(PipelineEvent::ItemSkipped {
                            stage: name.clone(),
                            reason: e.to_string(),
                        });
                    }
                    Err(StageError::Fatal(e)) => {
                        report_fatal(&name, e, &stop, &fatal_tx);
                        return;
                    }
                }
            }
            // Output sender drops here, propagating end of stream.
        })
        .unwrap_or_else(|e| panic!("failed to spawn stage thread: {e}"))
}

fn report_fatal(
    stage: &str,
    error: anyhow::Error,
    stop: &StopTrigger,
    fatal_tx: &Sender<FatalReport>,
) {
    log::error!("stage {stage}: fatal: {error:#}");
    let _ = fatal_tx.send(FatalReport {
        stage: stage.to_string(),
        error,
    });
    stop.fire();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{link, stop_channel, QueueSpec};

    struct Doubler;

    impl Stage<u32, u32> for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }
        fn process(&mut self, input: u32) -> Result<Vec<u32>, StageError> {
            if input == 13 {
                return Err(StageError::item("unlucky"));
            }
            Ok(vec![input * 2])
        }
    }

    struct Exploder;

    impl Stage<u32, u32> for Exploder {
        fn name(&self) -> &str {
            "exploder"
        }
        fn process(&mut self, _input: u32) -> Result<Vec<u32>, StageError> {
            Err(StageError::fatal("backend gone"))
        }
    }

    #[test]
    fn processes_items_and_skips_bad_ones() {
        let (trigger, token) = stop_channel();
        let monitor = Monitor::new();
        let (in_tx, in_rx) = link("in", QueueSpec::blocking(8), token.clone(), monitor.clone());
        let (out_tx, out_rx) = link("out", QueueSpec::blocking(8), token, monitor.clone());
        let handle = spawn_stage(
            Doubler,
            in_rx,
            out_tx,
            trigger,
            crossbeam_channel::unbounded().0,
            monitor.clone(),
        );

        for v in [1, 13, 3] {
            in_tx.send(v).unwrap();
        }
        drop(in_tx);
        handle.join().unwrap();

        let mut got = Vec::new();
        while let Ok(Some(v)) = out_rx.try_recv() {
            got.push(v);
        }
        assert_eq!(got, vec![2, 6]);
        assert_eq!(monitor.items_skipped(), 1);
    }

    #[test]
    fn fatal_error_fires_stop_and_reports() {
        let (trigger, token) = stop_channel();
        let monitor = Monitor::new();
        let (in_tx, in_rx) = link("in", QueueSpec::blocking(8), token.clone(), monitor.clone());
        let (out_tx, _out_rx) = link::<u32>("out", QueueSpec::blocking(8), token, monitor.clone());
        let (fatal_tx, fatal_rx) = crossbeam_channel::unbounded();
        let handle = spawn_stage(Exploder, in_rx, out_tx, trigger.clone(), fatal_tx, monitor);

        in_tx.send(1).unwrap();
        handle.join().unwrap();

        assert!(trigger.is_fired());
        let report = fatal_rx.try_recv().unwrap();
        assert_eq!(report.stage, "exploder");
    }

    #[test]
    fn end_of_stream_cascades_through_stage() {
        let (trigger, token) = stop_channel();
        let monitor = Monitor::new();
        let (in_tx, in_rx) = link("in", QueueSpec::blocking(8), token.clone(), monitor.clone());
        let (out_tx, out_rx) = link::<u32>("out", QueueSpec::blocking(8), token, monitor.clone());
        // Keep the trigger alive across the recv below: dropping it reads as
        // a fired stop and would race the end-of-stream signal.
        let handle = spawn_stage(
            Doubler,
            in_rx,
            out_tx,
            trigger.clone(),
            crossbeam_channel::unbounded().0,
            monitor,
        );

        drop(in_tx);
        handle.join().unwrap();
        assert_eq!(out_rx.recv(), Err(crate::queue::LinkRecvError::Closed));
        drop(trigger);
    }
}
