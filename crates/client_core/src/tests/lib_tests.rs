use super::*;
use crate::test_support::{eventually, fixture};

#[test]
fn default_config_uses_short_echo_window() {
    let config = ClientConfig::default();
    assert_eq!(config.like_echo_window, Duration::from_millis(900));
    assert_eq!(config.event_capacity, 1024);
}

#[tokio::test]
async fn sign_out_drops_session_and_local_state() {
    let fx = fixture().await;
    let conversation = fx.conversation().await;
    let bob = fx.client(fx.bob).await;
    bob.chat()
        .open_conversation(conversation.id)
        .await
        .expect("open");
    assert!(bob.session().is_signed_in().await);

    bob.sign_out().await;

    assert!(!bob.session().is_signed_in().await);
    assert!(bob.chat().current_conversation().await.is_none());
    assert!(bob.unread().snapshot().await.is_empty());
    assert!(matches!(
        bob.chat().refresh_conversations().await,
        Err(ChatError::NotSignedIn)
    ));
}

#[tokio::test]
async fn missing_broadcast_channel_refuses_publish() {
    let channel = MissingBroadcastChannel;
    let target = LikeTarget::GroupPost(shared::domain::PostId(1));
    let err = channel
        .publish(
            BroadcastTopic::Target { target },
            LikeBroadcast {
                target,
                group_id: GroupId(1),
                user_id: UserId(1),
                action: shared::protocol::LikeAction::Added,
                origin: None,
                seq: None,
            },
        )
        .await
        .expect_err("unavailable");
    assert!(err.to_string().contains("unavailable"));
}

#[tokio::test]
async fn restarting_realtime_keeps_a_single_consumer() {
    let fx = fixture().await;
    let conversation = fx.conversation().await;
    let alice = fx.client(fx.alice).await;
    let bob = fx.client(fx.bob).await;
    bob.start_realtime().await;
    bob.start_realtime().await;
    alice
        .chat()
        .open_conversation(conversation.id)
        .await
        .expect("open");

    alice.chat().send_message("ping").await.expect("send");

    let counted = eventually(|| {
        let bob = Arc::clone(&bob);
        async move { bob.unread().count(conversation.id).await > 0 }
    })
    .await;
    assert!(counted);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.unread().count(conversation.id).await, 1);

    bob.stop_realtime().await;
    alice.chat().send_message("pong").await.expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.unread().count(conversation.id).await, 1);
}
