use super::*;
use futures::stream;

#[test]
fn content_frame_is_json_payload() {
    let frame = GenerationEvent::Content("ATP \"synthase\"\n".to_string()).to_sse_frame();
    assert_eq!(frame, "data: {\"content\":\"ATP \\\"synthase\\\"\\n\"}\n\n");
}

#[test]
fn error_frame_is_json_payload() {
    let frame = GenerationEvent::Error("Please try again.".to_string()).to_sse_frame();
    assert_eq!(frame, "data: {\"error\":\"Please try again.\"}\n\n");
}

#[test]
fn done_frame_is_literal() {
    assert_eq!(GenerationEvent::Done.to_sse_frame(), "data: [DONE]\n\n");
    assert!(GenerationEvent::Done.is_terminal());
    assert!(!GenerationEvent::Content(String::new()).is_terminal());
}

#[tokio::test]
async fn frames_preserve_event_order() {
    let events = stream::iter(vec![
        GenerationEvent::Content("Hello".to_string()),
        GenerationEvent::Content(" world".to_string()),
        GenerationEvent::Done,
    ]);

    let frames: Vec<String> = sse_frames(events).collect().await;

    assert_eq!(
        frames,
        vec![
            "data: {\"content\":\"Hello\"}\n\n".to_string(),
            "data: {\"content\":\" world\"}\n\n".to_string(),
            DONE_FRAME.to_string(),
        ]
    );
}
