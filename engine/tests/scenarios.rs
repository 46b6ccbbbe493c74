//! End-to-end chat turn scenarios against the public engine API.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;

use toolcall_engine::{
    ArgsState, BackendError, BackendFut, CommandOutput, CompleteReason, ExecuteCtx, ExecuteOutput,
    ExecutionBackend, LifecycleRegistry, LifecycleStatus, LiveOutputHandle, NoTaskStore,
    PreviewCtx, ToolCallIdentity, ToolCallLifecycle,
};

/// Backend that answers by tool name, the way a host editor would.
struct ScriptedBackend {
    command_output: Mutex<Option<watch::Receiver<CommandOutput>>>,
}

impl ScriptedBackend {
    fn new(command_output: watch::Receiver<CommandOutput>) -> Arc<Self> {
        Arc::new(Self {
            command_output: Mutex::new(Some(command_output)),
        })
    }
}

impl ExecutionBackend for ScriptedBackend {
    fn preview<'a>(
        &'a self,
        tool_name: &'a str,
        args: Value,
        _ctx: PreviewCtx,
    ) -> BackendFut<'a, ()> {
        Box::pin(async move {
            if tool_name == "writeToFile" && args["path"] == "/etc/passwd" {
                return Err(BackendError::new("path is outside the workspace"));
            }
            Ok(())
        })
    }

    fn execute<'a>(
        &'a self,
        tool_name: &'a str,
        args: Value,
        ctx: ExecuteCtx,
    ) -> BackendFut<'a, ExecuteOutput> {
        Box::pin(async move {
            match tool_name {
                "executeCommand" => {
                    let output = self
                        .command_output
                        .lock()
                        .unwrap()
                        .take()
                        .ok_or_else(|| BackendError::new("command already started"))?;
                    Ok(ExecuteOutput::LiveOutput(LiveOutputHandle::new(output, || {})))
                }
                "listFiles" => {
                    ctx.cancel.cancelled().await;
                    Ok(json!({"files": [], "cancelled": ctx.cancel.reason()}).into())
                }
                _ => Ok(json!({"success": true, "path": args["path"]}).into()),
            }
        })
    }
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Drive a tool call the way the chat layer does: stream, finalize, approve.
async fn stream_and_approve(lifecycle: &ToolCallLifecycle, args: Value) {
    lifecycle
        .preview(json!({"path": "sr"}), ArgsState::Streaming)
        .unwrap();
    lifecycle.preview(args.clone(), ArgsState::Final).unwrap();
    let status = within(lifecycle.wait_until(|status| {
        status == LifecycleStatus::Ready || status == LifecycleStatus::Complete
    }))
    .await;
    if status == LifecycleStatus::Ready {
        lifecycle.execute(args).unwrap();
    }
}

#[tokio::test]
async fn chat_turn_with_mixed_tool_calls() {
    let (command_tx, command_rx) = watch::channel(CommandOutput::running(""));
    let backend = ScriptedBackend::new(command_rx);
    let registry = LifecycleRegistry::new(backend, Arc::new(NoTaskStore::default()));

    let write = registry.get_or_create(ToolCallIdentity::new("writeToFile", "call-write"));
    let denied = registry.get_or_create(ToolCallIdentity::new("writeToFile", "call-denied"));
    let command = registry.get_or_create(ToolCallIdentity::new("executeCommand", "call-cmd"));
    assert_eq!(registry.previewing().len(), 3);

    stream_and_approve(&write, json!({"path": "src/main.rs"})).await;
    stream_and_approve(&denied, json!({"path": "/etc/passwd"})).await;
    stream_and_approve(&command, json!({"command": "cargo fmt"})).await;

    within(command.wait_until(|status| status == LifecycleStatus::ExecuteStreaming)).await;
    assert!(registry.is_busy());

    command_tx
        .send(CommandOutput::completed("formatted 3 files"))
        .unwrap();

    let written = within(write.wait_complete()).await.unwrap();
    assert_eq!(written.reason, CompleteReason::ExecuteFinish);
    assert_eq!(written.result["path"], "src/main.rs");

    let rejected = within(denied.wait_complete()).await.unwrap();
    assert_eq!(rejected.reason, CompleteReason::PreviewReject);

    let ran = within(command.wait_complete()).await.unwrap();
    assert_eq!(
        ran.result,
        json!({"output": "formatted 3 files", "isTruncated": false})
    );

    assert!(!registry.is_busy());
    assert_eq!(registry.completed().len(), 3);
    for lifecycle in registry.completed() {
        lifecycle.dispose().unwrap();
    }
    assert!(registry.completed().is_empty());
}

#[tokio::test]
async fn stopping_the_turn_settles_every_call() {
    let (_command_tx, command_rx) = watch::channel(CommandOutput::running(""));
    let backend = ScriptedBackend::new(command_rx);
    let registry = LifecycleRegistry::new(backend, Arc::new(NoTaskStore::default()));

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let listing = registry.get_or_create(ToolCallIdentity::new("listFiles", "call-ls"));
    let sink = Arc::clone(&transitions);
    listing.subscribe(move |event| {
        sink.lock().unwrap().push(event.status);
        ControlFlow::Continue(())
    });
    stream_and_approve(&listing, json!({"path": "."})).await;
    let streaming = registry.get_or_create(ToolCallIdentity::new("writeToFile", "call-late"));
    streaming
        .preview(json!({"path": "sr"}), ArgsState::Streaming)
        .unwrap();

    // The stop button: settle previews now, signal executions.
    registry.abort_previewing();
    registry.abort_all("user stopped the turn");

    assert_eq!(
        streaming.complete().unwrap().reason,
        CompleteReason::UserAbort
    );
    let listed = within(listing.wait_complete()).await.unwrap();
    assert_eq!(listed.reason, CompleteReason::UserAbort);
    assert_eq!(listed.result["cancelled"], "user stopped the turn");
    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            LifecycleStatus::Init,
            LifecycleStatus::Pending,
            LifecycleStatus::Ready,
            LifecycleStatus::Execute,
            LifecycleStatus::Complete,
        ]
    );
}
