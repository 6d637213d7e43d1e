//! End-to-end exercises of the gateway's stream plumbing: decoding a chunked
//! upstream byte stream, deriving flavor events, and the bridge's bounded
//! pending queue.

use axum::extract::ws::Message;
use forgegate::gateway::flavor::{FlavorCategory, FlavorContext, flavor_from_log};
use forgegate::gateway::frames::{FrameDecoder, SseFrame};
use forgegate::gateway::ws::PendingQueue;

/// Simulate an upstream connection that dies mid-frame and reconnects; the
/// decoder must not leak the partial frame into the second connection.
#[test]
fn reconnect_resumes_on_clean_frame_boundary() {
    let mut decoder = FrameDecoder::new();

    let mut frames = decoder.feed(b"event: log\ndata: {\"msg\":\"Stage: generate\"}\n\n");
    frames.extend(decoder.feed(b"event: log\ndata: {\"msg\":\"half-finis"));
    assert_eq!(frames.len(), 1);

    // Upstream dropped; new connection replays from its own boundary.
    decoder.reset();
    frames.extend(decoder.feed(b"event: log\ndata: {\"msg\":\"iter 1/5: compile failed\"}\n\n"));
    frames.extend(decoder.feed(b"event: end\ndata: {}\n\n"));

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[1].event, "log");
    assert_eq!(frames[2].event, "end");
}

/// A full stream transcript: every recognized log line produces its flavor
/// events in order, and the terminal frame is detectable by event name.
#[test]
fn transcript_drives_flavor_and_terminal_detection() {
    let transcript: &[&[u8]] = &[
        b"event: log\ndata: {\"msg\":\"Stage: generate\"}\n\n",
        b"event: log\ndata: {\"msg\":\"Stage: compile\"}\n\n",
        b"event: log\ndata: {\"msg\":\"Contract chosen for deploy: Token\"}\n\n",
        b"event: log\ndata: {\"msg\":\"Deploy success. Address=0x00000000000000000000000000000000000000aa\"}\n\n",
        b"event: end\ndata: {}\n\n",
    ];

    let mut decoder = FrameDecoder::new();
    let mut ctx = FlavorContext::default();
    let mut categories = Vec::new();
    let mut saw_end = false;

    for chunk in transcript {
        for frame in decoder.feed(chunk) {
            if frame.event == "end" {
                saw_end = true;
            }
            if frame.event == "log" {
                let msg = frame
                    .data_json()
                    .and_then(|data| data["msg"].as_str().map(str::to_string))
                    .unwrap_or_default();
                for event in flavor_from_log(&msg, &ctx) {
                    if let Some(name) = &event.contract_name {
                        ctx.contract_name = Some(name.clone());
                    }
                    categories.push(event.category);
                }
            }
        }
    }

    assert!(saw_end);
    assert_eq!(
        categories,
        vec![
            FlavorCategory::Generation,
            FlavorCategory::Compilation,
            FlavorCategory::Deployment,
            FlavorCategory::Deployment,
            FlavorCategory::Celebration,
        ]
    );
}

/// Byte-size backpressure: pushing more than the byte bound before the
/// upstream opens must report overflow instead of growing without limit.
#[test]
fn pending_queue_fails_fast_on_byte_bound() {
    let mut queue = PendingQueue::new(200, 1_000);
    let frame = "x".repeat(300);

    assert!(queue.push(Message::Text(frame.clone())).is_ok());
    assert!(queue.push(Message::Text(frame.clone())).is_ok());
    assert!(queue.push(Message::Text(frame.clone())).is_ok());
    // Fourth frame crosses 1000 bytes.
    assert!(queue.push(Message::Text(frame)).is_err());
}

/// Frames buffered before the upstream opened flush in arrival order.
#[test]
fn pending_queue_preserves_arrival_order() {
    let mut queue = PendingQueue::new(10, 10_000);
    for index in 0..5 {
        queue
            .push(Message::Text(format!("frame-{index}")))
            .expect("within bounds");
    }
    let drained: Vec<String> = queue
        .drain()
        .into_iter()
        .filter_map(|message| match message {
            Message::Text(text) => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(drained, vec!["frame-0", "frame-1", "frame-2", "frame-3", "frame-4"]);
}

/// The decoder treats event-only frames (no data) as valid events.
#[test]
fn event_only_frames_survive_decoding() {
    let mut decoder = FrameDecoder::new();
    let frames = decoder.feed(b"event: end\n\n");
    assert_eq!(frames, vec![SseFrame::new("end", "")]);
}
