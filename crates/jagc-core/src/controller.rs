//! Per-thread correlation between submitted runs and session events.
//!
//! One controller per live session. Runs queue here (steer ahead of
//! follow-up), get delivered to the session one call at a time, then sit in
//! a pending deque until the session's assistant turn resolves them. The
//! event stream is consumed by a single loop reading an explicit inbox, so
//! correlation state never mutates across concurrent closures.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use jagc_store::Store;
use jagc_types::{DeliveryMode, ImagePayload, MessageRole, RunEvent, RunOutput, SessionEvent};

use crate::executor::{SessionHandle, TurnSession};
use crate::progress::ProgressBus;

pub const AGENT_ENDED_ERROR: &str = "agent ended before message delivery";

#[derive(Debug)]
pub struct SubmitRun {
    pub run_id: String,
    pub text: String,
    pub delivery_mode: DeliveryMode,
    pub images: Vec<ImagePayload>,
}

enum Cmd {
    Submit {
        run: SubmitRun,
        done: oneshot::Sender<anyhow::Result<RunOutput>>,
    },
}

enum Inbox {
    DeliveryDone {
        run_id: String,
        result: anyhow::Result<()>,
    },
}

#[derive(Clone)]
pub struct ThreadRunController {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl ThreadRunController {
    pub fn spawn(
        thread_key: String,
        handle: SessionHandle,
        store: Store,
        progress: ProgressBus,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let state = LoopState {
            thread_key,
            session: handle.session,
            store,
            progress,
            steer: VecDeque::new(),
            follow_up: VecDeque::new(),
            pending: VecDeque::new(),
            delivering: None,
            deliver_prematched: false,
            completions: HashMap::new(),
            prompted: handle.resumed,
            current_message: None,
        };
        tokio::spawn(run_loop(state, cmd_rx, handle.events));
        Self { cmd_tx }
    }

    /// Queue a run for delivery. The returned receiver resolves once the
    /// session produces (or fails to produce) a terminal output for it.
    pub async fn submit(
        &self,
        run: SubmitRun,
    ) -> anyhow::Result<oneshot::Receiver<anyhow::Result<RunOutput>>> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Submit { run, done })
            .await
            .map_err(|_| anyhow::anyhow!(AGENT_ENDED_ERROR))?;
        Ok(rx)
    }

    /// True once the session ended and this controller stopped accepting
    /// work; the owner should replace it.
    pub fn is_terminated(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

struct QueuedEntry {
    run: SubmitRun,
}

struct PendingRun {
    run_id: String,
    text: String,
    delivery_mode: DeliveryMode,
    matched: bool,
    user_accum: String,
}

struct LoopState {
    thread_key: String,
    session: Arc<dyn TurnSession>,
    store: Store,
    progress: ProgressBus,
    steer: VecDeque<QueuedEntry>,
    follow_up: VecDeque<QueuedEntry>,
    pending: VecDeque<PendingRun>,
    /// The run whose delivery call is currently awaiting the session.
    delivering: Option<SubmitRun>,
    /// Set when the session echoed the user message before the delivery call
    /// returned; the run enters `pending` already matched.
    deliver_prematched: bool,
    completions: HashMap<String, oneshot::Sender<anyhow::Result<RunOutput>>>,
    prompted: bool,
    /// Role of the message currently streaming, with the run it belongs to.
    current_message: Option<(MessageRole, Option<String>)>,
}

async fn run_loop(
    mut st: LoopState,
    mut cmd_rx: mpsc::Receiver<Cmd>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    let (inbox_tx, mut inbox_rx) = mpsc::channel::<Inbox>(8);

    loop {
        maybe_start_delivery(&mut st, &inbox_tx);

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Submit { run, done }) => st.enqueue(run, done),
                None => break,
            },
            ev = events.recv() => {
                let ended = match ev {
                    Some(event) => st.handle_event(event).await,
                    None => {
                        debug!(thread_key = %st.thread_key, "session event stream closed");
                        true
                    }
                };
                if ended {
                    st.fail_everything(AGENT_ENDED_ERROR);
                    break;
                }
            },
            Some(Inbox::DeliveryDone { run_id, result }) = inbox_rx.recv() => {
                st.handle_delivery_done(run_id, result).await;
            },
        }
    }

    st.session.shutdown().await;
}

fn maybe_start_delivery(st: &mut LoopState, inbox_tx: &mpsc::Sender<Inbox>) {
    if st.delivering.is_some() {
        return;
    }
    let Some(entry) = st.steer.pop_front().or_else(|| st.follow_up.pop_front()) else {
        return;
    };
    let run = entry.run;
    let run_id = run.run_id.clone();
    let text = run.text.clone();
    let images = run.images.clone();
    let mode = run.delivery_mode;
    let first = !st.prompted;
    st.prompted = true;
    st.delivering = Some(run);

    let session = st.session.clone();
    let tx = inbox_tx.clone();
    tokio::spawn(async move {
        let result = if first {
            session.prompt(&text, &images).await
        } else {
            match mode {
                DeliveryMode::Steer => session.steer(&text).await,
                DeliveryMode::FollowUp => session.follow_up(&text, &images).await,
            }
        };
        let _ = tx.send(Inbox::DeliveryDone { run_id, result }).await;
    });
}

impl LoopState {
    fn enqueue(&mut self, run: SubmitRun, done: oneshot::Sender<anyhow::Result<RunOutput>>) {
        self.progress.publish(&run.run_id, RunEvent::Queued);
        self.completions.insert(run.run_id.clone(), done);
        match run.delivery_mode {
            DeliveryMode::Steer => self.steer.push_back(QueuedEntry { run }),
            DeliveryMode::FollowUp => self.follow_up.push_back(QueuedEntry { run }),
        }
    }

    async fn handle_delivery_done(&mut self, run_id: String, result: anyhow::Result<()>) {
        let Some(run) = self.delivering.take() else {
            error!(run_id, "delivery completion without an in-flight delivery");
            return;
        };
        debug_assert_eq!(run.run_id, run_id);

        match result {
            Ok(()) => {
                let matched = std::mem::take(&mut self.deliver_prematched);
                self.pending.push_back(PendingRun {
                    run_id: run.run_id.clone(),
                    text: run.text,
                    delivery_mode: run.delivery_mode,
                    matched,
                    user_accum: String::new(),
                });
                self.progress.publish(&run.run_id, RunEvent::Delivered);
                // Images rode along with the delivery call; drop the stored
                // copies. A failed cleanup fails the run rather than being
                // swallowed.
                if let Err(err) = self.store.delete_run_input_images(&run.run_id).await {
                    error!(run_id = %run.run_id, %err, "input image cleanup failed");
                    self.pending.retain(|p| p.run_id != run.run_id);
                    self.complete(&run.run_id, Err(anyhow::anyhow!(err)));
                }
            }
            Err(err) => {
                warn!(run_id = %run.run_id, %err, "session delivery failed");
                self.complete(&run.run_id, Err(err));
            }
        }
    }

    /// Returns true when the agent ended and the loop should stop.
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        let tag = match &event {
            SessionEvent::MessageStart { role } => {
                let run_id = match role {
                    MessageRole::User => {
                        if let Some(p) = self.pending.iter_mut().find(|p| !p.matched) {
                            p.matched = true;
                            p.user_accum.clear();
                            Some(p.run_id.clone())
                        } else if let Some(run) = &self.delivering {
                            // Session echoed the user text before the
                            // delivery call returned.
                            self.deliver_prematched = true;
                            Some(run.run_id.clone())
                        } else {
                            self.fallback_run_id()
                        }
                    }
                    MessageRole::Assistant => self.active_run_id(),
                };
                self.current_message = Some((*role, run_id.clone()));
                run_id
            }
            SessionEvent::MessageUpdate { delta, .. } => {
                if let Some((MessageRole::User, Some(run_id))) = self.current_message.clone() {
                    if let Some(p) = self.pending.iter_mut().find(|p| p.run_id == run_id) {
                        p.user_accum.push_str(delta);
                    }
                    Some(run_id)
                } else {
                    self.current_message
                        .as_ref()
                        .and_then(|(_, id)| id.clone())
                        .or_else(|| self.active_run_id())
                }
            }
            SessionEvent::MessageEnd {
                role,
                text,
                provider,
                model,
                structured,
            } => {
                let (_, current_run) = self.current_message.take().unwrap_or((*role, None));
                match role {
                    MessageRole::User => {
                        if let Some(run_id) = &current_run {
                            if let Some(p) = self.pending.iter().find(|p| &p.run_id == run_id) {
                                if !text.is_empty() && *text != p.text {
                                    debug!(run_id, "user message text differs from submitted input");
                                }
                            }
                        }
                        current_run
                    }
                    MessageRole::Assistant => {
                        let resolved = self
                            .pending
                            .iter()
                            .position(|p| p.matched)
                            .and_then(|idx| self.pending.remove(idx));
                        match resolved {
                            Some(p) => {
                                let output = RunOutput::Message {
                                    text: text.clone(),
                                    delivery_mode: p.delivery_mode,
                                    provider: provider.clone(),
                                    model: model.clone(),
                                    structured: structured.clone(),
                                };
                                let run_id = p.run_id.clone();
                                self.complete(&run_id, Ok(output));
                                Some(run_id)
                            }
                            None => {
                                debug!("assistant message without a pending run");
                                current_run.or_else(|| self.fallback_run_id())
                            }
                        }
                    }
                }
            }
            SessionEvent::AgentEnd => {
                let tag = self.fallback_run_id();
                if let Some(run_id) = &tag {
                    self.progress
                        .publish(run_id, RunEvent::Session(event.clone()));
                }
                return true;
            }
            // Lifecycle and tool events belong to whichever run is active,
            // falling back to the head of the queue before first correlation.
            _ => self.active_run_id().or_else(|| self.fallback_run_id()),
        };

        match tag {
            Some(run_id) => self.progress.publish(&run_id, RunEvent::Session(event)),
            None => debug!(thread_key = %self.thread_key, "uncorrelated session event dropped"),
        }
        false
    }

    /// First matched-but-unresolved pending run.
    fn active_run_id(&self) -> Option<String> {
        self.pending
            .iter()
            .find(|p| p.matched)
            .map(|p| p.run_id.clone())
    }

    /// Head-of-line run before correlation: oldest pending, else the run
    /// being delivered, else the head of the queues.
    fn fallback_run_id(&self) -> Option<String> {
        self.pending
            .front()
            .map(|p| p.run_id.clone())
            .or_else(|| self.delivering.as_ref().map(|r| r.run_id.clone()))
            .or_else(|| self.steer.front().map(|e| e.run.run_id.clone()))
            .or_else(|| self.follow_up.front().map(|e| e.run.run_id.clone()))
    }

    fn complete(&mut self, run_id: &str, result: anyhow::Result<RunOutput>) {
        if let Some(done) = self.completions.remove(run_id) {
            let _ = done.send(result);
        } else {
            debug!(run_id, "completion already taken");
        }
    }

    fn fail_everything(&mut self, reason: &str) {
        let mut ids: Vec<String> = self.pending.iter().map(|p| p.run_id.clone()).collect();
        ids.extend(self.delivering.as_ref().map(|r| r.run_id.clone()));
        ids.extend(self.steer.iter().map(|e| e.run.run_id.clone()));
        ids.extend(self.follow_up.iter().map(|e| e.run.run_id.clone()));
        self.pending.clear();
        self.steer.clear();
        self.follow_up.clear();
        self.delivering = None;
        for run_id in ids {
            self.complete(&run_id, Err(anyhow::anyhow!("{reason}")));
        }
        // Anything still in the completion map belongs to runs submitted but
        // never queued; fail those too.
        let leftovers: Vec<String> = self.completions.keys().cloned().collect();
        for run_id in leftovers {
            self.complete(&run_id, Err(anyhow::anyhow!("{reason}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted session: records delivery calls and lets the test drive the
    /// event stream by hand.
    struct ScriptedSession {
        calls: Mutex<Vec<String>>,
        events_tx: mpsc::Sender<SessionEvent>,
    }

    impl ScriptedSession {
        fn new() -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
            let (events_tx, events_rx) = mpsc::channel(64);
            (
                Arc::new(Self {
                    calls: Mutex::new(Vec::new()),
                    events_tx,
                }),
                events_rx,
            )
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn emit(&self, event: SessionEvent) {
            self.events_tx.send(event).await.unwrap();
        }

        async fn emit_assistant_reply(&self, text: &str) {
            self.emit(SessionEvent::TurnStart).await;
            self.emit(SessionEvent::MessageStart {
                role: MessageRole::User,
            })
            .await;
            self.emit(SessionEvent::MessageEnd {
                role: MessageRole::User,
                text: String::new(),
                provider: None,
                model: None,
                structured: None,
            })
            .await;
            self.emit(SessionEvent::MessageStart {
                role: MessageRole::Assistant,
            })
            .await;
            self.emit(SessionEvent::MessageEnd {
                role: MessageRole::Assistant,
                text: text.to_string(),
                provider: Some("test".into()),
                model: Some("test-1".into()),
                structured: None,
            })
            .await;
            self.emit(SessionEvent::TurnEnd {
                tool_result_count: 0,
            })
            .await;
        }
    }

    #[async_trait]
    impl TurnSession for ScriptedSession {
        async fn prompt(&self, text: &str, _images: &[ImagePayload]) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("prompt:{text}"));
            Ok(())
        }

        async fn follow_up(&self, text: &str, _images: &[ImagePayload]) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("follow_up:{text}"));
            Ok(())
        }

        async fn steer(&self, text: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("steer:{text}"));
            Ok(())
        }

        async fn abort_turn(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn set_model(&self, _model: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn set_thinking_level(&self, _level: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    fn controller(
        session: Arc<ScriptedSession>,
        events: mpsc::Receiver<SessionEvent>,
        resumed: bool,
    ) -> ThreadRunController {
        let handle = SessionHandle {
            session: session.clone(),
            events,
            session_id: "sess-1".into(),
            session_file: "/tmp/sess-1.jsonl".into(),
            resumed,
        };
        ThreadRunController::spawn(
            "test:thread".into(),
            handle,
            Store::open_in_memory().unwrap(),
            ProgressBus::new(),
        )
    }

    fn submit_run(run_id: &str, text: &str, mode: DeliveryMode) -> SubmitRun {
        SubmitRun {
            run_id: run_id.into(),
            text: text.into(),
            delivery_mode: mode,
            images: Vec::new(),
        }
    }

    /// Let spawned delivery tasks and the controller loop drain.
    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn first_run_uses_prompt_then_follow_up() {
        let (session, events) = ScriptedSession::new();
        let ctl = controller(session.clone(), events, false);

        let rx1 = ctl
            .submit(submit_run("r1", "one", DeliveryMode::FollowUp))
            .await
            .unwrap();
        settle().await;
        session.emit_assistant_reply("first answer").await;
        let out1 = rx1.await.unwrap().unwrap();
        assert_eq!(out1.text(), "first answer");

        let rx2 = ctl
            .submit(submit_run("r2", "two", DeliveryMode::FollowUp))
            .await
            .unwrap();
        settle().await;
        session.emit_assistant_reply("second answer").await;
        let out2 = rx2.await.unwrap().unwrap();
        assert_eq!(out2.text(), "second answer");

        assert_eq!(session.calls(), vec!["prompt:one", "follow_up:two"]);
    }

    #[tokio::test]
    async fn resumed_session_skips_prompt() {
        let (session, events) = ScriptedSession::new();
        let ctl = controller(session.clone(), events, true);

        let rx = ctl
            .submit(submit_run("r1", "hello again", DeliveryMode::FollowUp))
            .await
            .unwrap();
        settle().await;
        session.emit_assistant_reply("welcome back").await;
        rx.await.unwrap().unwrap();
        assert_eq!(session.calls(), vec!["follow_up:hello again"]);
    }

    #[tokio::test]
    async fn steer_queue_drains_first() {
        let (session, events) = ScriptedSession::new();
        let ctl = controller(session.clone(), events, true);

        // Submit in one batch before the loop gets a chance to deliver: the
        // steer run must jump the follow-up already waiting behind it.
        let rx_follow = ctl
            .submit(submit_run("rf", "normal", DeliveryMode::FollowUp))
            .await
            .unwrap();
        let rx_steer = ctl
            .submit(submit_run("rs", "interrupt", DeliveryMode::Steer))
            .await
            .unwrap();
        settle().await;

        // The first delivery is already committed before the steer arrives;
        // resolve it, then the steer must beat nothing else.
        session.emit_assistant_reply("normal done").await;
        rx_follow.await.unwrap().unwrap();
        settle().await;
        session.emit_assistant_reply("steer done").await;
        let steer_out = rx_steer.await.unwrap().unwrap();
        assert_eq!(steer_out.text(), "steer done");

        let calls = session.calls();
        assert_eq!(calls[0], "follow_up:normal");
        assert_eq!(calls[1], "steer:interrupt");
    }

    #[tokio::test]
    async fn agent_end_fails_pending_runs() {
        let (session, events) = ScriptedSession::new();
        let ctl = controller(session.clone(), events, true);

        let rx = ctl
            .submit(submit_run("r1", "never answered", DeliveryMode::FollowUp))
            .await
            .unwrap();
        settle().await;
        session.emit(SessionEvent::AgentStart).await;
        session.emit(SessionEvent::AgentEnd).await;

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains(AGENT_ENDED_ERROR));

        // The controller is spent: later submits fail fast.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ctl.is_terminated());
    }

    #[tokio::test]
    async fn structured_output_is_preserved() {
        let (session, events) = ScriptedSession::new();
        let ctl = controller(session.clone(), events, true);

        let rx = ctl
            .submit(submit_run("r1", "give me json", DeliveryMode::FollowUp))
            .await
            .unwrap();
        settle().await;
        session
            .emit(SessionEvent::MessageStart {
                role: MessageRole::User,
            })
            .await;
        session
            .emit(SessionEvent::MessageStart {
                role: MessageRole::Assistant,
            })
            .await;
        session
            .emit(SessionEvent::MessageEnd {
                role: MessageRole::Assistant,
                text: "{\"answer\":42}".into(),
                provider: Some("test".into()),
                model: Some("test-1".into()),
                structured: Some(json!({"answer": 42})),
            })
            .await;

        let out = rx.await.unwrap().unwrap();
        match out {
            RunOutput::Message { structured, .. } => {
                assert_eq!(structured, Some(json!({"answer": 42})));
            }
        }
    }
}
