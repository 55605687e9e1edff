use std::sync::Arc;
use std::time::{Duration, Instant};

use concord_core::{CheckSettings, Chunk, Finding, Rule, SamplingConfig};

use crate::llm::LlmGateway;
use crate::progress::{NoProgress, ProgressEvent, ProgressSink};
use crate::prompt::{build_conversation, parse_response};
use crate::validate::validate_findings;

/// How one LLM call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The gateway answered; the response may still have held no findings.
    Completed,
    /// The per-call timeout elapsed first.
    TimedOut,
    /// The gateway returned an error or the call panicked.
    Failed(String),
}

/// Findings from one attempt on a chunk. Failed attempts carry none.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    /// 1-based attempt number.
    pub index: usize,
    pub findings: Vec<Finding>,
    pub outcome: AttemptOutcome,
    pub duration: Duration,
}

impl AttemptResult {
    /// Whether the gateway produced a response.
    pub fn is_completed(&self) -> bool {
        self.outcome == AttemptOutcome::Completed
    }
}

/// Runs the configured number of attempts on a chunk, one after another.
///
/// Each call is spawned onto the runtime and awaited under the per-call
/// timeout. On timeout the task is detached: it may keep running but its
/// result is discarded. No failure of a single attempt aborts the chunk.
#[derive(Clone)]
pub struct AttemptRunner {
    gateway: Arc<dyn LlmGateway>,
    repeat: usize,
    timeout: Duration,
    sampling: SamplingConfig,
    progress: Arc<dyn ProgressSink>,
}

impl AttemptRunner {
    /// Runner using `repeat`, `llm_timeout_secs` and `sampling` from
    /// `settings`.
    pub fn new(gateway: Arc<dyn LlmGateway>, settings: &CheckSettings) -> Self {
        Self {
            gateway,
            repeat: settings.repeat.max(1),
            timeout: Duration::from_secs(settings.llm_timeout_secs),
            sampling: settings.sampling.clone(),
            progress: Arc::new(NoProgress),
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Report call start and end to `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn repeat(&self) -> usize {
        self.repeat
    }

    /// Run every attempt on `chunk`, returning one result per attempt in order.
    pub async fn run(&self, chunk: &Chunk, rules: &[Rule]) -> Vec<AttemptResult> {
        let mut results = Vec::with_capacity(self.repeat);
        for index in 1..=self.repeat {
            self.progress.on_event(&ProgressEvent::LlmCallStart {
                file: chunk.file_path.clone(),
                chunk: chunk.index,
                attempt: index,
                attempts: self.repeat,
            });

            let result = self.attempt(index, chunk, rules).await;

            if let AttemptOutcome::Failed(reason) = &result.outcome {
                tracing::warn!(
                    chunk = chunk.index,
                    attempt = index,
                    %reason,
                    "LLM attempt failed"
                );
            } else if result.outcome == AttemptOutcome::TimedOut {
                tracing::warn!(
                    chunk = chunk.index,
                    attempt = index,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "LLM attempt timed out"
                );
            }

            self.progress.on_event(&ProgressEvent::LlmCallEnd {
                file: chunk.file_path.clone(),
                chunk: chunk.index,
                attempt: index,
                duration: result.duration,
                issues: result.findings.len(),
                ok: result.is_completed(),
            });
            results.push(result);
        }
        results
    }

    async fn attempt(&self, index: usize, chunk: &Chunk, rules: &[Rule]) -> AttemptResult {
        let started = Instant::now();
        let messages = build_conversation(chunk, rules);
        let gateway = Arc::clone(&self.gateway);
        let sampling = self.sampling.clone();
        let call = tokio::spawn(async move { gateway.chat(messages, &sampling).await });

        let (findings, outcome) = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(raw))) => {
                let findings = validate_findings(parse_response(&raw), chunk, rules);
                (findings, AttemptOutcome::Completed)
            }
            Ok(Ok(Err(e))) => (Vec::new(), AttemptOutcome::Failed(e.to_string())),
            Ok(Err(join)) => (
                Vec::new(),
                AttemptOutcome::Failed(format!("LLM call panicked: {join}")),
            ),
            Err(_) => (Vec::new(), AttemptOutcome::TimedOut),
        };

        AttemptResult {
            index,
            findings,
            outcome,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use concord_core::{ConcordError, Severity};

    use super::*;
    use crate::llm::ChatMessage;

    /// Replies from a script, one entry per call.
    struct Scripted {
        replies: Vec<Script>,
        calls: AtomicUsize,
        seen_sampling: Mutex<Vec<SamplingConfig>>,
    }

    #[derive(Clone)]
    enum Script {
        Reply(&'static str),
        Fail,
        Hang,
        Panic,
    }

    impl Scripted {
        fn new(replies: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                replies,
                calls: AtomicUsize::new(0),
                seen_sampling: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmGateway for Scripted {
        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            sampling: &SamplingConfig,
        ) -> Result<String, ConcordError> {
            self.seen_sampling.lock().unwrap().push(sampling.clone());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.replies[n % self.replies.len()].clone() {
                Script::Reply(s) => Ok(s.to_string()),
                Script::Fail => Err(ConcordError::Llm("boom".into())),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
                Script::Panic => panic!("gateway bug"),
            }
        }
    }

    const ONE: &str = r#"{"issues":[{"rule_id":"R","line_start":2,"line_end":3,"description":"d"}]}"#;

    fn chunk() -> Chunk {
        Chunk {
            content: "a\nb\nc\nd".into(),
            start_line: 1,
            end_line: 4,
            index: 0,
            file_path: PathBuf::from("a.rs"),
        }
    }

    fn settings(repeat: usize) -> CheckSettings {
        CheckSettings {
            repeat,
            ..CheckSettings::default()
        }
    }

    #[tokio::test]
    async fn every_attempt_runs_with_fixed_sampling() {
        let gw = Scripted::new(vec![Script::Reply(ONE)]);
        let runner = AttemptRunner::new(gw.clone(), &settings(3));
        let rules = vec![Rule::new("R", "x", Severity::Warning)];
        let results = runner.run(&chunk(), &rules).await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_completed() && r.findings.len() == 1));
        assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        let seen = gw.seen_sampling.lock().unwrap();
        assert!(seen.iter().all(|s| *s == SamplingConfig::default()));
    }

    #[tokio::test]
    async fn failures_do_not_abort_the_chunk() {
        let gw = Scripted::new(vec![Script::Fail, Script::Panic, Script::Reply(ONE)]);
        let runner = AttemptRunner::new(gw, &settings(3));
        let results = runner.run(&chunk(), &[]).await;

        assert!(matches!(results[0].outcome, AttemptOutcome::Failed(ref m) if m.contains("boom")));
        assert!(matches!(results[1].outcome, AttemptOutcome::Failed(ref m) if m.contains("panicked")));
        assert!(results[0].findings.is_empty() && results[1].findings.is_empty());
        assert_eq!(results[2].findings.len(), 1);
    }

    #[tokio::test]
    async fn timeout_yields_empty_attempt() {
        let gw = Scripted::new(vec![Script::Hang, Script::Reply(ONE)]);
        let runner =
            AttemptRunner::new(gw, &settings(2)).with_timeout(Duration::from_millis(50));
        let results = runner.run(&chunk(), &[]).await;

        assert_eq!(results[0].outcome, AttemptOutcome::TimedOut);
        assert!(results[0].findings.is_empty());
        assert!(results[1].is_completed());
    }

    #[tokio::test]
    async fn progress_reports_start_and_end_per_attempt() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = Arc::clone(&events);
            move |e: &ProgressEvent| events.lock().unwrap().push(e.clone())
        };
        let gw = Scripted::new(vec![Script::Reply(ONE), Script::Fail]);
        let runner = AttemptRunner::new(gw, &settings(2)).with_progress(Arc::new(sink));
        runner.run(&chunk(), &[]).await;

        let events = events.lock().unwrap();
        let steps: Vec<_> = events.iter().map(|e| e.step()).collect();
        assert_eq!(
            steps,
            vec!["llm_call_start", "llm_call_end", "llm_call_start", "llm_call_end"]
        );
        match &events[3] {
            ProgressEvent::LlmCallEnd { ok, issues, attempt, .. } => {
                assert!(!ok);
                assert_eq!(*issues, 0);
                assert_eq!(*attempt, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn responses_are_validated_against_length_rules() {
        let reply = r#"{"issues":[{"rule_id":"len","line_start":1,"line_end":3,"description":"too long"}]}"#;
        let gw = Scripted::new(vec![Script::Reply(reply)]);
        let runner = AttemptRunner::new(gw, &settings(1));
        let rules = vec![Rule::new("len", "max 5 lines", Severity::Warning)];
        let results = runner.run(&chunk(), &rules).await;
        assert!(results[0].is_completed());
        assert!(results[0].findings.is_empty());
    }
}
