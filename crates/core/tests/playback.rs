mod common;

use std::{sync::Arc, time::Duration};

use kiosk_voice_core::{
    AudioErrorKind, AudioInput, ContextState, GestureEvent, GestureKind, LipSyncOptions,
    QueueEvent,
};
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mark {
    Start(u32, Instant),
    End(u32, Instant),
}

fn tracked(log: &Arc<Mutex<Vec<Mark>>>, id: u32) -> LipSyncOptions {
    let (starts, ends) = (log.clone(), log.clone());
    LipSyncOptions::new()
        .with_lip_sync(true)
        .on_viseme(|_, _| {})
        .on_play(move || starts.lock().push(Mark::Start(id, Instant::now())))
        .on_ended(move || ends.lock().push(Mark::End(id, Instant::now())))
}

#[tokio::test(start_paused = true)]
async fn queued_utterances_play_in_order_without_overlap() {
    let engine = common::engine();
    engine
        .gate()
        .handle_gesture(GestureEvent::trusted(GestureKind::PointerDown))
        .await
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut events = engine.queue().subscribe();
    let tickets: Vec<_> = [(1, 0.8), (2, 0.3), (3, 0.5)]
        .into_iter()
        .map(|(id, seconds)| {
            engine.queue().submit(
                AudioInput::binary(common::utterance(seconds, 16_000)),
                tracked(&log, id),
            )
        })
        .collect();

    for ticket in tickets {
        let outcome = ticket.wait().await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert!(!outcome.data.unwrap().interrupted);
    }
    engine.queue().wait_idle().await;

    let log = log.lock().clone();
    let order: Vec<_> = log
        .iter()
        .map(|mark| match mark {
            Mark::Start(id, _) => (*id, true),
            Mark::End(id, _) => (*id, false),
        })
        .collect();
    assert_eq!(
        order,
        vec![(1, true), (1, false), (2, true), (2, false), (3, true), (3, false)]
    );

    for pair in log.windows(2) {
        if let [Mark::End(_, ended), Mark::Start(_, started)] = pair {
            assert!(started >= ended);
        }
    }

    let mut finished = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::UtteranceFinished(id) = event {
            finished.push(id);
        }
    }
    assert_eq!(finished, vec![1, 2, 3]);
    assert_eq!(engine.queue().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn nothing_starts_before_the_first_gesture() {
    let engine = common::engine();
    let order = Arc::new(Mutex::new(Vec::new()));

    for id in 1..=3 {
        let order = order.clone();
        engine.gate().execute_when_ready(Box::new(move || {
            order.lock().push(id);
            Ok(())
        }));
    }

    let blocked = engine
        .orchestrator()
        .play_audio(&AudioInput::binary(common::utterance(0.3, 16_000)))
        .await;
    assert!(!blocked.success);
    assert_eq!(blocked.error.unwrap().kind, AudioErrorKind::InteractionRequired);

    let waiting = engine.queue().submit(
        AudioInput::binary(common::utterance(0.3, 16_000)),
        LipSyncOptions::new().wait_for_interaction(true),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(order.lock().is_empty());
    assert!(!engine.context().is_running());
    assert_eq!(engine.context().handle_creations(), 0);

    engine
        .gate()
        .handle_gesture(GestureEvent::trusted(GestureKind::TouchEnd))
        .await
        .unwrap();
    assert_eq!(*order.lock(), vec![1, 2, 3]);
    assert!(waiting.wait().await.success);

    engine
        .gate()
        .handle_gesture(GestureEvent::trusted(GestureKind::Click))
        .await
        .unwrap();
    assert_eq!(*order.lock(), vec![1, 2, 3]);
    assert_eq!(engine.context().handle_creations(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_and_allows_a_fresh_context() {
    let engine = common::engine();
    engine.context().ensure_resumed().await.unwrap();
    engine.context().ensure_resumed().await.unwrap();
    assert_eq!(engine.context().handle_creations(), 1);

    engine.shutdown().await.unwrap();
    assert_eq!(engine.context().state(), ContextState::Closed);

    engine.context().initialize().await.unwrap();
    assert_eq!(engine.context().state(), ContextState::Running);
}
