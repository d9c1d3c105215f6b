//! Graceful-then-forceful termination as an explicit state machine.
//!
//! [`TerminationEscalation`] never sleeps; it only says which signal to send
//! next and how long to wait for it. [`escalate_until_exit`] drives it with
//! tokio timers against a real exit future.

use std::future::Future;
use std::time::Duration;

use crate::process_runtime_error::ProcessRuntimeError;
use crate::process_spawn_runtime::ProcessSignal;

pub const FOREGROUND_TIMEOUT_GRACE_MS: u64 = 1_500;
pub const RECORDER_INTERRUPT_GRACE_MS: u64 = 700;
pub const RECORDER_TERMINATE_GRACE_MS: u64 = 2_200;
const FORCEFUL_KILL_REAP_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationPhase {
    Running,
    SignaledGraceful,
    SignaledForceful,
    Exited,
}

impl EscalationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::SignaledGraceful => "signaled_graceful",
            Self::SignaledForceful => "signaled_forceful",
            Self::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationStep {
    pub signal: ProcessSignal,
    pub wait_after: Duration,
}

/// Ordered signal steps; the last one is the forceful kill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationPlan {
    steps: Vec<EscalationStep>,
}

impl EscalationPlan {
    /// Builds a plan, falling back to a lone kill when `steps` is empty.
    pub fn new(steps: Vec<EscalationStep>) -> Self {
        if steps.is_empty() {
            return Self {
                steps: vec![EscalationStep {
                    signal: ProcessSignal::Kill,
                    wait_after: Duration::from_millis(FORCEFUL_KILL_REAP_MS),
                }],
            };
        }
        Self { steps }
    }

    /// `SIGTERM`, 1.5 s, `SIGKILL`.
    pub fn foreground_timeout() -> Self {
        Self::new(vec![
            EscalationStep {
                signal: ProcessSignal::Terminate,
                wait_after: Duration::from_millis(FOREGROUND_TIMEOUT_GRACE_MS),
            },
            EscalationStep {
                signal: ProcessSignal::Kill,
                wait_after: Duration::from_millis(FORCEFUL_KILL_REAP_MS),
            },
        ])
    }

    /// `SIGINT`, 0.7 s, `SIGTERM`, 2.2 s, `SIGKILL`.
    pub fn recorder_stop() -> Self {
        Self::new(vec![
            EscalationStep {
                signal: ProcessSignal::Interrupt,
                wait_after: Duration::from_millis(RECORDER_INTERRUPT_GRACE_MS),
            },
            EscalationStep {
                signal: ProcessSignal::Terminate,
                wait_after: Duration::from_millis(RECORDER_TERMINATE_GRACE_MS),
            },
            EscalationStep {
                signal: ProcessSignal::Kill,
                wait_after: Duration::from_millis(FORCEFUL_KILL_REAP_MS),
            },
        ])
    }

    pub fn steps(&self) -> &[EscalationStep] {
        self.steps.as_slice()
    }
}

#[derive(Debug, Clone)]
pub struct TerminationEscalation {
    plan: EscalationPlan,
    next_step: usize,
    phase: EscalationPhase,
}

impl TerminationEscalation {
    pub fn new(plan: EscalationPlan) -> Self {
        Self {
            plan,
            next_step: 0,
            phase: EscalationPhase::Running,
        }
    }

    pub fn phase(&self) -> EscalationPhase {
        self.phase
    }

    /// First signal to send. `None` once escalation already started or the process exited.
    pub fn begin(&mut self) -> Option<ProcessSignal> {
        if self.phase != EscalationPhase::Running {
            return None;
        }
        self.advance()
    }

    /// Called when the wait after the last signal elapsed without an exit.
    pub fn on_deadline(&mut self) -> Option<ProcessSignal> {
        match self.phase {
            EscalationPhase::SignaledGraceful => self.advance(),
            _ => None,
        }
    }

    pub fn on_exit(&mut self) {
        self.phase = EscalationPhase::Exited;
    }

    /// How long to wait after the most recently issued signal.
    pub fn pending_wait(&self) -> Option<Duration> {
        if matches!(
            self.phase,
            EscalationPhase::Running | EscalationPhase::Exited
        ) {
            return None;
        }
        self.next_step
            .checked_sub(1)
            .and_then(|index| self.plan.steps.get(index))
            .map(|step| step.wait_after)
    }

    fn advance(&mut self) -> Option<ProcessSignal> {
        let step = self.plan.steps.get(self.next_step)?;
        self.next_step += 1;
        self.phase = if self.next_step >= self.plan.steps.len() {
            EscalationPhase::SignaledForceful
        } else {
            EscalationPhase::SignaledGraceful
        };
        Some(step.signal)
    }
}

/// Result of driving an escalation to completion.
#[derive(Debug)]
pub struct EscalationOutcome<T> {
    /// Output of the exit future, `None` if the process outlived the final wait.
    pub exit: Option<T>,
    pub signals_sent: Vec<ProcessSignal>,
    pub final_phase: EscalationPhase,
}

/// Sends the plan's signals through `deliver` until `exit` resolves.
///
/// Delivery failures are logged and do not stop the escalation; a process
/// that is already gone resolves `exit` on the next poll.
pub async fn escalate_until_exit<T, F, D>(
    plan: EscalationPlan,
    exit: F,
    mut deliver: D,
) -> EscalationOutcome<T>
where
    F: Future<Output = T>,
    D: FnMut(ProcessSignal) -> Result<(), ProcessRuntimeError>,
{
    let mut machine = TerminationEscalation::new(plan);
    let mut signals_sent = Vec::new();
    tokio::pin!(exit);

    let mut next_signal = machine.begin();
    while let Some(signal) = next_signal {
        if let Err(error) = deliver(signal) {
            if !error.is_no_such_process() {
                tracing::warn!(
                    signal = signal.as_str(),
                    error = %error,
                    "termination signal delivery failed"
                );
            }
        }
        signals_sent.push(signal);
        let wait = machine.pending_wait().unwrap_or_default();
        tokio::select! {
            output = &mut exit => {
                machine.on_exit();
                return EscalationOutcome {
                    exit: Some(output),
                    signals_sent,
                    final_phase: machine.phase(),
                };
            }
            _ = tokio::time::sleep(wait) => {
                next_signal = machine.on_deadline();
            }
        }
    }

    let final_phase = machine.phase();
    tracing::warn!(
        phase = final_phase.as_str(),
        "process did not exit after the final termination signal"
    );
    EscalationOutcome {
        exit: None,
        signals_sent,
        final_phase,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{
        escalate_until_exit, EscalationPhase, EscalationPlan, TerminationEscalation,
        FOREGROUND_TIMEOUT_GRACE_MS, RECORDER_INTERRUPT_GRACE_MS, RECORDER_TERMINATE_GRACE_MS,
    };
    use crate::process_spawn_runtime::ProcessSignal;

    #[test]
    fn unit_recorder_plan_walks_graceful_then_forceful_phases() {
        let mut machine = TerminationEscalation::new(EscalationPlan::recorder_stop());
        assert_eq!(machine.phase(), EscalationPhase::Running);
        assert_eq!(machine.pending_wait(), None);

        assert_eq!(machine.begin(), Some(ProcessSignal::Interrupt));
        assert_eq!(machine.phase(), EscalationPhase::SignaledGraceful);
        assert_eq!(
            machine.pending_wait(),
            Some(Duration::from_millis(RECORDER_INTERRUPT_GRACE_MS))
        );
        assert_eq!(machine.begin(), None);

        assert_eq!(machine.on_deadline(), Some(ProcessSignal::Terminate));
        assert_eq!(machine.phase(), EscalationPhase::SignaledGraceful);
        assert_eq!(
            machine.pending_wait(),
            Some(Duration::from_millis(RECORDER_TERMINATE_GRACE_MS))
        );

        assert_eq!(machine.on_deadline(), Some(ProcessSignal::Kill));
        assert_eq!(machine.phase(), EscalationPhase::SignaledForceful);
        assert_eq!(machine.on_deadline(), None);

        machine.on_exit();
        assert_eq!(machine.phase(), EscalationPhase::Exited);
        assert_eq!(machine.pending_wait(), None);
    }

    #[test]
    fn unit_exit_before_begin_suppresses_all_signals() {
        let mut machine = TerminationEscalation::new(EscalationPlan::foreground_timeout());
        machine.on_exit();
        assert_eq!(machine.begin(), None);
        assert_eq!(machine.on_deadline(), None);
    }

    #[test]
    fn regression_empty_plan_falls_back_to_single_kill() {
        let plan = EscalationPlan::new(Vec::new());
        assert_eq!(plan.steps().len(), 1);
        let mut machine = TerminationEscalation::new(plan);
        assert_eq!(machine.begin(), Some(ProcessSignal::Kill));
        assert_eq!(machine.phase(), EscalationPhase::SignaledForceful);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_foreground_plan_kills_after_grace_when_terminate_is_ignored() {
        let sent = Arc::new(Mutex::new(Vec::<(ProcessSignal, Duration)>::new()));
        let started = Instant::now();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel::<i32>();
        let mut exit_tx = Some(exit_tx);
        let recorder = Arc::clone(&sent);

        let outcome = escalate_until_exit(
            EscalationPlan::foreground_timeout(),
            async move { exit_rx.await.unwrap_or(-1) },
            move |signal| {
                recorder
                    .lock()
                    .expect("lock")
                    .push((signal, started.elapsed()));
                if signal == ProcessSignal::Kill {
                    if let Some(tx) = exit_tx.take() {
                        let _ = tx.send(137);
                    }
                }
                Ok(())
            },
        )
        .await;

        assert_eq!(outcome.exit, Some(137));
        assert_eq!(outcome.final_phase, EscalationPhase::Exited);
        let sent = sent.lock().expect("lock").clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (ProcessSignal::Terminate, Duration::ZERO));
        assert_eq!(sent[1].0, ProcessSignal::Kill);
        let grace = Duration::from_millis(FOREGROUND_TIMEOUT_GRACE_MS);
        assert!(sent[1].1 >= grace);
        assert!(sent[1].1 < grace + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn functional_recorder_plan_stops_at_interrupt_when_process_honours_it() {
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel::<()>();
        let mut exit_tx = Some(exit_tx);
        let outcome = escalate_until_exit(
            EscalationPlan::recorder_stop(),
            async move {
                let _ = exit_rx.await;
                "exited"
            },
            move |signal| {
                if signal == ProcessSignal::Interrupt {
                    if let Some(tx) = exit_tx.take() {
                        let _ = tx.send(());
                    }
                }
                Ok(())
            },
        )
        .await;
        assert_eq!(outcome.exit, Some("exited"));
        assert_eq!(outcome.signals_sent, vec![ProcessSignal::Interrupt]);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_unresponsive_process_reports_no_exit_after_full_plan() {
        let started = Instant::now();
        let outcome = escalate_until_exit(
            EscalationPlan::recorder_stop(),
            std::future::pending::<()>(),
            |_signal| Ok(()),
        )
        .await;
        assert!(outcome.exit.is_none());
        assert_eq!(outcome.final_phase, EscalationPhase::SignaledForceful);
        assert_eq!(
            outcome.signals_sent,
            vec![
                ProcessSignal::Interrupt,
                ProcessSignal::Terminate,
                ProcessSignal::Kill
            ]
        );
        let total: u64 = EscalationPlan::recorder_stop()
            .steps()
            .iter()
            .map(|step| u64::try_from(step.wait_after.as_millis()).unwrap_or(u64::MAX))
            .sum();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(total));
        assert!(elapsed < Duration::from_millis(total + 10));
    }
}
