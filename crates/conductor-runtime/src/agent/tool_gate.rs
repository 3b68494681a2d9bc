//! Tool gate: stop check → approval → execute, for one tool call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor_core::ids::SessionId;
use conductor_core::messages::{ToolCall, TranscriptEntry};
use conductor_core::progress::PendingApprovalInfo;
use conductor_core::tools::{ToolContext, ToolFailure};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::progress::ProgressTracker;
use crate::agent::run_loop::RunContext;
use crate::approval::{ApprovalDecision, DenialReason};
use crate::errors::RuntimeError;

/// What happened to one tool call.
#[derive(Debug)]
pub(crate) enum GateOutcome {
    /// The call produced a transcript entry (success, error, or denial).
    Finished(TranscriptEntry),
    /// A stop was observed; the call did not produce a result.
    Stopped,
}

/// Run one tool call through the gate.
///
/// Pipeline: stop check → approval (if required) → stop check → execute.
/// Transient failures and denials become error-tagged results; a fatal
/// pipeline failure is returned as an error.
#[instrument(skip_all, fields(tool_name = %call.name, session_id = %session_id))]
pub(crate) async fn run_tool_call(
    ctx: &RunContext,
    session_id: &SessionId,
    call: &ToolCall,
    cancel: &CancellationToken,
    tracker: &Arc<ProgressTracker>,
) -> Result<GateOutcome, RuntimeError> {
    // 1. Stop check
    if ctx.registry.is_stop_requested(session_id) {
        return Ok(GateOutcome::Stopped);
    }

    // 2. Approval gate
    if ctx.config.approval.requires_approval(&call.name) {
        let decision = await_approval(ctx, session_id, call, cancel, tracker).await?;
        if ctx.registry.is_stop_requested(session_id) {
            return Ok(GateOutcome::Stopped);
        }
        if let ApprovalDecision::Denied(reason) = decision {
            warn!(%reason, "tool call denied");
            tracker.step(format!("Denied {}", call.name));
            return Ok(GateOutcome::Finished(denied_result(call, reason)));
        }
        tracker.step(format!("Approved {}", call.name));
    }

    // 3. Execute
    tracker.step(format!("Running {}", call.name));
    let progress = Arc::clone(tracker);
    let tool_ctx = ToolContext {
        session_id: session_id.clone(),
        tool_call_id: call.id.clone(),
        cancellation: cancel.clone(),
        on_progress: Some(Arc::new(move |description: &str| progress.step(description))),
    };
    let start = Instant::now();
    let result = ctx.tools.execute(call, &tool_ctx).await;
    debug!(duration_ms = start.elapsed().as_millis() as u64, "tool finished");

    match result {
        Ok(output) => Ok(GateOutcome::Finished(TranscriptEntry::ToolResult {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: output.content,
            is_error: output.is_error,
        })),
        Err(ToolFailure::Transient(message)) => {
            warn!(error = %message, "tool failed, reporting to model");
            Ok(GateOutcome::Finished(TranscriptEntry::ToolResult {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: message,
                is_error: true,
            }))
        }
        Err(ToolFailure::Fatal(message)) => {
            error!(error = %message, "tool pipeline failed");
            Err(RuntimeError::ToolPipeline {
                tool_name: call.name.clone(),
                message,
            })
        }
    }
}

enum Wake {
    Decided(ApprovalDecision),
    Stopped,
    TimedOut,
}

async fn await_approval(
    ctx: &RunContext,
    session_id: &SessionId,
    call: &ToolCall,
    cancel: &CancellationToken,
    tracker: &ProgressTracker,
) -> Result<ApprovalDecision, RuntimeError> {
    let mut handle =
        ctx.broker
            .request_approval(session_id, &call.id, &call.name, &call.arguments)?;
    let approval_id = handle.approval_id().clone();
    tracker.awaiting_approval(PendingApprovalInfo {
        approval_id: approval_id.clone(),
        tool_name: call.name.clone(),
        arguments: call.arguments.clone(),
    });
    info!(approval_id = %approval_id, "waiting for approval");

    let timeout = ctx.config.approval.timeout_ms.map(Duration::from_millis);
    let wake = tokio::select! {
        biased;
        decision = handle.decision() => Wake::Decided(decision),
        () = cancel.cancelled() => Wake::Stopped,
        () = elapsed(timeout) => Wake::TimedOut,
    };

    // Whoever removes the broker entry first decides; the handle then holds
    // that decision, so reading it again cannot block.
    let decision = match wake {
        Wake::Decided(decision) => decision,
        Wake::Stopped => {
            let _ = ctx.broker.cancel_session_approvals(session_id);
            handle.decision().await
        }
        Wake::TimedOut => {
            let _ = ctx.broker.expire(&approval_id);
            handle.decision().await
        }
    };
    debug!(approval_id = %approval_id, ?decision, "approval resolved");
    Ok(decision)
}

async fn elapsed(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn denied_result(call: &ToolCall, reason: DenialReason) -> TranscriptEntry {
    let content = match reason {
        DenialReason::User => "Tool call denied by user".to_owned(),
        other => format!("Tool call denied: {other}"),
    };
    TranscriptEntry::ToolResult {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content,
        is_error: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, ToolBehavior};
    use assert_matches::assert_matches;
    use conductor_settings::ApprovalMode;

    fn call(name: &str) -> ToolCall {
        ToolCall::new(name, serde_json::Map::new())
    }

    fn content(outcome: GateOutcome) -> (String, bool) {
        match outcome {
            GateOutcome::Finished(TranscriptEntry::ToolResult {
                content, is_error, ..
            }) => (content, is_error),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn executes_without_approval() {
        let h = Harness::builder().tool("read", ToolBehavior::Echo).build();
        let sid = h.session();
        let outcome = run_tool_call(&h.ctx, &sid, &call("read"), &h.token(&sid), &h.tracker(&sid))
            .await
            .unwrap();
        assert_eq!(content(outcome), ("read ok".to_owned(), false));
        assert_eq!(h.tools.executed(), vec!["read"]);
    }

    #[tokio::test]
    async fn transient_failure_becomes_error_result() {
        let h = Harness::builder()
            .tool("bash", ToolBehavior::Transient("exit 1".into()))
            .build();
        let sid = h.session();
        let outcome = run_tool_call(&h.ctx, &sid, &call("bash"), &h.token(&sid), &h.tracker(&sid))
            .await
            .unwrap();
        assert_eq!(content(outcome), ("exit 1".to_owned(), true));
    }

    #[tokio::test]
    async fn fatal_failure_is_an_error() {
        let h = Harness::builder()
            .tool("bash", ToolBehavior::Fatal("sandbox gone".into()))
            .build();
        let sid = h.session();
        let err = run_tool_call(&h.ctx, &sid, &call("bash"), &h.token(&sid), &h.tracker(&sid))
            .await
            .unwrap_err();
        assert_matches!(err, RuntimeError::ToolPipeline { tool_name, .. } if tool_name == "bash");
    }

    #[tokio::test]
    async fn stopped_session_skips_execution() {
        let h = Harness::builder().tool("read", ToolBehavior::Echo).build();
        let sid = h.session();
        let _ = h.ctx.registry.stop(&sid).unwrap();
        let outcome = run_tool_call(&h.ctx, &sid, &call("read"), &h.token(&sid), &h.tracker(&sid))
            .await
            .unwrap();
        assert_matches!(outcome, GateOutcome::Stopped);
        assert!(h.tools.executed().is_empty());
    }

    #[tokio::test]
    async fn denial_yields_error_result() {
        let h = Harness::builder()
            .approval(ApprovalMode::Always, None)
            .tool("bash", ToolBehavior::Echo)
            .build();
        let sid = h.session();
        let broker = Arc::clone(&h.ctx.broker);
        let responder_sid = sid.clone();
        let responder = tokio::spawn(async move {
            loop {
                if let Some(req) = broker.pending(&responder_sid).first() {
                    assert!(broker.respond(&req.id, false));
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let outcome = run_tool_call(&h.ctx, &sid, &call("bash"), &h.token(&sid), &h.tracker(&sid))
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(content(outcome), ("Tool call denied by user".to_owned(), true));
        assert!(h.tools.executed().is_empty());
    }

    #[tokio::test]
    async fn approval_runs_tool() {
        let h = Harness::builder()
            .approval(ApprovalMode::Listed, None)
            .approve_tools(&["bash"])
            .tool("bash", ToolBehavior::Echo)
            .build();
        let sid = h.session();
        let broker = Arc::clone(&h.ctx.broker);
        let responder_sid = sid.clone();
        let responder = tokio::spawn(async move {
            loop {
                if let Some(req) = broker.pending(&responder_sid).first() {
                    assert!(broker.respond(&req.id, true));
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let outcome = run_tool_call(&h.ctx, &sid, &call("bash"), &h.token(&sid), &h.tracker(&sid))
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(content(outcome), ("bash ok".to_owned(), false));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_approval_times_out_as_denied() {
        let h = Harness::builder()
            .approval(ApprovalMode::Always, Some(5_000))
            .tool("bash", ToolBehavior::Echo)
            .build();
        let sid = h.session();
        let outcome = run_tool_call(&h.ctx, &sid, &call("bash"), &h.token(&sid), &h.tracker(&sid))
            .await
            .unwrap();
        assert_eq!(
            content(outcome),
            ("Tool call denied: approval timed out".to_owned(), true)
        );
        assert_eq!(h.ctx.broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn stop_while_waiting_ends_the_call() {
        let h = Harness::builder()
            .approval(ApprovalMode::Always, None)
            .tool("bash", ToolBehavior::Echo)
            .build();
        let sid = h.session();
        let registry = Arc::clone(&h.ctx.registry);
        let broker = Arc::clone(&h.ctx.broker);
        let stopper_sid = sid.clone();
        let stopper = tokio::spawn(async move {
            while broker.pending(&stopper_sid).is_empty() {
                tokio::task::yield_now().await;
            }
            let _ = registry.stop(&stopper_sid).unwrap();
        });

        let outcome = run_tool_call(&h.ctx, &sid, &call("bash"), &h.token(&sid), &h.tracker(&sid))
            .await
            .unwrap();
        stopper.await.unwrap();
        assert_matches!(outcome, GateOutcome::Stopped);
        assert_eq!(h.ctx.broker.pending_count(), 0);
        assert!(h.tools.executed().is_empty());
    }

    #[tokio::test]
    async fn tool_progress_lands_in_steps() {
        let h = Harness::builder().tool("slow", ToolBehavior::Report).build();
        let sid = h.session();
        let tracker = h.tracker(&sid);
        let _ = run_tool_call(&h.ctx, &sid, &call("slow"), &h.token(&sid), &tracker)
            .await
            .unwrap();
        let steps: Vec<String> = tracker.steps().into_iter().map(|s| s.description).collect();
        assert_eq!(steps, vec!["Running slow", "slow: halfway"]);
    }
}
