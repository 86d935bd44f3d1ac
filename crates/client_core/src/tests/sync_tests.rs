use super::*;

use shared::domain::UserId;

const CONVERSATION: ConversationId = ConversationId(3);

fn msg(id: i64) -> Message {
    Message {
        id: MessageId(id),
        conversation_id: CONVERSATION,
        sender_id: UserId(1),
        content: Some(format!("text {id}")),
        is_edited: false,
        deleted: false,
        created_at: None,
        attachments: Vec::new(),
    }
}

fn engine() -> (SyncEngine, broadcast::Receiver<ClientEvent>) {
    let (tx, rx) = broadcast::channel(64);
    (SyncEngine::new(tx), rx)
}

async fn ids(engine: &SyncEngine) -> Vec<i64> {
    engine
        .timeline(CONVERSATION)
        .await
        .into_iter()
        .map(|m| m.id.0)
        .collect()
}

#[tokio::test]
async fn deleted_frame_removes_cached_message() {
    let (engine, _rx) = engine();
    engine
        .merge_page(CONVERSATION, PageCursor::Latest, vec![msg(1), msg(2), msg(3)])
        .await;

    let frame = ServerFrame::decode(r#"{"type":"message:deleted","message_ids":[2]}"#);
    assert!(engine.apply_frame(CONVERSATION, frame).await);
    assert_eq!(ids(&engine).await, vec![1, 3]);
}

#[tokio::test]
async fn bulk_delete_applies_only_deleted_subset() {
    let (engine, _rx) = engine();
    engine
        .merge_page(
            CONVERSATION,
            PageCursor::Latest,
            vec![msg(4), msg(5), msg(6), msg(7)],
        )
        .await;

    let result = BulkDeleteResult {
        deleted: vec![MessageId(5)],
        forbidden: vec![MessageId(6)],
        not_found: vec![MessageId(7)],
    };
    assert_eq!(engine.apply_bulk_delete(CONVERSATION, &result).await, 1);
    assert_eq!(ids(&engine).await, vec![4, 6, 7]);
}

#[tokio::test]
async fn duplicate_new_frame_emits_single_history_event() {
    let (engine, mut rx) = engine();
    let frame = ServerFrame::MessageNew { message: msg(9) };

    assert!(engine.apply_frame(CONVERSATION, frame.clone()).await);
    assert!(!engine.apply_frame(CONVERSATION, frame).await);

    assert!(matches!(
        rx.try_recv(),
        Ok(ClientEvent::HistoryChanged { conversation_id }) if conversation_id == CONVERSATION
    ));
    assert!(rx.try_recv().is_err());
    assert_eq!(ids(&engine).await, vec![9]);
}

#[tokio::test]
async fn unknown_and_connected_frames_leave_cache_untouched() {
    let (engine, _rx) = engine();
    engine
        .merge_page(CONVERSATION, PageCursor::Latest, vec![msg(1)])
        .await;

    assert!(!engine.apply_frame(CONVERSATION, ServerFrame::Unknown).await);
    assert!(
        !engine
            .apply_frame(
                CONVERSATION,
                ServerFrame::Connected {
                    conversation_id: CONVERSATION,
                    user_id: UserId(1),
                },
            )
            .await
    );
    assert_eq!(ids(&engine).await, vec![1]);
}

#[tokio::test]
async fn edit_after_delete_is_ignored() {
    let (engine, _rx) = engine();
    engine
        .merge_page(CONVERSATION, PageCursor::Latest, vec![msg(1), msg(2)])
        .await;
    engine.remove(CONVERSATION, &[MessageId(2)]).await;

    let edited = Message {
        content: Some("edited late".into()),
        is_edited: true,
        ..msg(2)
    };
    assert_eq!(
        engine.patch(CONVERSATION, edited).await,
        MergeOutcome::Ignored
    );
    assert_eq!(ids(&engine).await, vec![1]);
}

#[tokio::test]
async fn clear_all_forgets_history_and_cursor_state() {
    let (engine, _rx) = engine();
    engine
        .merge_page(CONVERSATION, PageCursor::Latest, vec![msg(1)])
        .await;
    engine
        .merge_page(CONVERSATION, PageCursor::Before(MessageId(1)), Vec::new())
        .await;
    assert!(engine.is_fully_loaded(CONVERSATION).await);
    assert!(engine.has_history(CONVERSATION).await);

    engine.clear_all().await;
    assert!(!engine.has_history(CONVERSATION).await);
    assert!(!engine.is_fully_loaded(CONVERSATION).await);
    assert_eq!(engine.oldest_id(CONVERSATION).await, None);
}
