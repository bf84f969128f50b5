use super::*;
use crate::test_support::ScriptedCompletion;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

fn orchestrator(service: Arc<dyn CompletionService>) -> GenerationOrchestrator {
    GenerationOrchestrator::new(service, CompletionOptions::default())
}

fn chat(question: &str) -> GenerationRequest {
    GenerationRequest::new(TaskContext::Chat {
        question: question.to_string(),
    })
}

/// Streams numbered tokens forever and flags when its consumer goes away
struct EndlessCompletion {
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl CompletionService for EndlessCompletion {
    async fn complete(&self, _: &[ChatMessage], _: &CompletionOptions) -> Result<String> {
        Ok(String::new())
    }

    async fn stream(&self, _: &[ChatMessage], _: &CompletionOptions) -> Result<TokenStream> {
        let (tx, rx) = mpsc::channel::<Result<String>>(1);
        let stopped = Arc::clone(&self.stopped);
        tokio::spawn(async move {
            let mut n = 0u64;
            loop {
                if tx.send(Ok(format!("t{n} "))).await.is_err() {
                    stopped.store(true, Ordering::SeqCst);
                    break;
                }
                n += 1;
            }
        });
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|t| (t, rx)) }).boxed())
    }
}

struct RefusingCompletion;

#[async_trait]
impl CompletionService for RefusingCompletion {
    async fn complete(&self, _: &[ChatMessage], _: &CompletionOptions) -> Result<String> {
        Err(StudyError::GenerationService("HTTP 503".to_string()))
    }

    async fn stream(&self, _: &[ChatMessage], _: &CompletionOptions) -> Result<TokenStream> {
        Err(StudyError::GenerationService("HTTP 503".to_string()))
    }
}

#[tokio::test]
async fn tokens_are_forwarded_in_order_then_done() {
    let service = Arc::new(ScriptedCompletion::new(&["Mito", "chondria", " make", " ATP"]));
    let events: Vec<GenerationEvent> = orchestrator(service)
        .generate(&chat("What makes ATP?"))
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            GenerationEvent::Content("Mito".to_string()),
            GenerationEvent::Content("chondria".to_string()),
            GenerationEvent::Content(" make".to_string()),
            GenerationEvent::Content(" ATP".to_string()),
            GenerationEvent::Done,
        ]
    );
}

#[tokio::test]
async fn mid_stream_error_yields_one_error_then_done() {
    let service = Arc::new(ScriptedCompletion::new(&["Question", " 1:", " What"]).failing_after(2));
    let frames: Vec<String> = sse_frames(orchestrator(service).generate(&chat("exam"))).collect().await;

    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0], "data: {\"content\":\"Question\"}\n\n");
    assert_eq!(frames[1], "data: {\"content\":\" 1:\"}\n\n");
    assert!(frames[2].starts_with("data: {\"error\":"));
    assert!(!frames[2].contains("connection reset"));
    assert_eq!(frames[3], DONE_FRAME);
    assert_eq!(frames.iter().filter(|f| *f == DONE_FRAME).count(), 1);
}

#[tokio::test]
async fn refused_stream_still_terminates() {
    let events: Vec<GenerationEvent> = orchestrator(Arc::new(RefusingCompletion))
        .generate(&chat("hello"))
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], GenerationEvent::Error(_)));
    assert_eq!(events[1], GenerationEvent::Done);
}

#[tokio::test]
async fn finish_hook_runs_only_on_clean_finish() {
    let captured = Arc::new(Mutex::new(None::<String>));

    let sink = Arc::clone(&captured);
    let hook: FinishHook = Box::new(move |text| {
        Box::pin(async move {
            *sink.lock().await = Some(text);
        })
    });
    let service = Arc::new(ScriptedCompletion::new(&["Question 1:", " What?"]));
    let _: Vec<GenerationEvent> = orchestrator(service)
        .generate_with_hook(&chat("exam"), Some(hook))
        .collect()
        .await;
    assert_eq!(captured.lock().await.as_deref(), Some("Question 1: What?"));

    let failed = Arc::new(Mutex::new(None::<String>));
    let sink = Arc::clone(&failed);
    let hook: FinishHook = Box::new(move |text| {
        Box::pin(async move {
            *sink.lock().await = Some(text);
        })
    });
    let service = Arc::new(ScriptedCompletion::new(&["Question 1:", " What?"]).failing_after(1));
    let _: Vec<GenerationEvent> = orchestrator(service)
        .generate_with_hook(&chat("exam"), Some(hook))
        .collect()
        .await;
    assert!(failed.lock().await.is_none());
}

#[tokio::test]
async fn dropping_the_stream_stops_the_producer() {
    let stopped = Arc::new(AtomicBool::new(false));
    let service = Arc::new(EndlessCompletion {
        stopped: Arc::clone(&stopped),
    });

    let mut events = orchestrator(service).generate(&chat("keep talking"));
    for _ in 0..3 {
        assert!(matches!(events.next().await, Some(GenerationEvent::Content(_))));
    }
    drop(events);

    for _ in 0..100 {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped.load(Ordering::SeqCst));
}

#[test]
fn messages_are_system_history_then_user() {
    let service = Arc::new(ScriptedCompletion::new(&[]));
    let request = chat("And the Krebs cycle?")
        .with_context(vec!["The Krebs cycle occurs in the matrix.".to_string()])
        .with_history(vec![
            ChatMessage::user("What is glycolysis?"),
            ChatMessage::assistant("Glucose breakdown."),
        ])
        .with_improvement_notes(vec!["Cite the context.".to_string()]);

    let messages = orchestrator(service).build_messages(&request);

    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].role, Role::System);
    assert!(messages[0].content.contains("The Krebs cycle occurs in the matrix."));
    assert!(messages[0].content.contains("Cite the context."));
    assert_eq!(messages[1], ChatMessage::user("What is glycolysis?"));
    assert_eq!(messages[2], ChatMessage::assistant("Glucose breakdown."));
    assert_eq!(messages[3], ChatMessage::user("And the Krebs cycle?"));
}

#[tokio::test]
async fn self_critique_uses_critique_prompt() {
    let service = Arc::new(ScriptedCompletion::new(&[]).with_reply(" 1. Vary the stems.\n"));
    let critique = orchestrator(service.clone())
        .self_critique("Question 1: What is a neuron?")
        .await
        .expect("critique");

    assert_eq!(critique, "1. Vary the stems.");
    let requests = service.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0][1].content.contains("Provide 3 improvements"));
}

#[tokio::test]
async fn empty_completion_is_a_generation_error() {
    let service = Arc::new(ScriptedCompletion::new(&[]).with_reply("   "));
    let result = orchestrator(service).complete(&chat("hi")).await;
    assert!(matches!(result, Err(StudyError::GenerationService(_))));
}
