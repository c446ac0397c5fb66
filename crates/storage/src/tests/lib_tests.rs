use super::*;
use chrono::{Duration, TimeZone};

async fn seeded() -> (Storage, UserId, UserId, GroupId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice").await.expect("alice");
    let bob = storage.create_user("bob").await.expect("bob");
    let group = storage.create_group("hiking", alice).await.expect("group");
    (storage, alice, bob, group)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn direct_chat_lookup_ignores_pair_order() {
    let (storage, alice, bob, group) = seeded().await;
    let created = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");

    let found = storage
        .find_direct_chat(group, bob, alice)
        .await
        .expect("lookup")
        .expect("found");
    assert_eq!(found.id, created.id);
    assert_eq!(found.host_id, alice);
    assert_eq!(found.member_id, bob);
}

#[tokio::test]
async fn second_insert_for_same_pair_reports_conflict() {
    let (storage, alice, bob, group) = seeded().await;
    storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");

    let duplicate = storage
        .insert_direct_chat(group, bob, alice, Utc::now())
        .await
        .expect("insert");
    assert!(duplicate.is_none());
}

#[tokio::test]
async fn same_pair_in_another_group_gets_its_own_chat() {
    let (storage, alice, bob, group) = seeded().await;
    let other_group = storage.create_group("chess", bob).await.expect("group");
    let first = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    let second = storage
        .insert_direct_chat(other_group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn rejects_chat_with_self() {
    let (storage, alice, _bob, group) = seeded().await;
    let err = storage
        .insert_direct_chat(group, alice, alice, Utc::now())
        .await
        .expect_err("self chat");
    assert!(err.to_string().contains("two distinct users"));
}

#[tokio::test]
async fn new_chat_seeds_active_participants_for_both_sides() {
    let (storage, alice, bob, group) = seeded().await;
    let chat = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");

    for user in [alice, bob] {
        let participant = storage
            .load_participant(chat.id, user)
            .await
            .expect("load")
            .expect("participant");
        assert!(participant.is_active());
        assert_eq!(participant.joined_at, chat.created_at);
    }
}

#[tokio::test]
async fn reactivation_clears_left_at_and_moves_cutoff_forward() {
    let (storage, alice, bob, group) = seeded().await;
    let chat = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    let before = storage
        .load_participant(chat.id, alice)
        .await
        .expect("load")
        .expect("participant");

    let left = storage
        .mark_participant_left(chat.id, alice, Utc::now())
        .await
        .expect("leave")
        .expect("participant");
    assert!(!left.is_active());

    // same timestamp as the original join: the cutoff must still advance
    let rejoined = storage
        .reactivate_participant(chat.id, alice, before.joined_at)
        .await
        .expect("rejoin")
        .expect("participant");
    assert!(rejoined.is_active());
    assert!(rejoined.joined_at > before.joined_at);
}

#[tokio::test]
async fn leaving_twice_keeps_first_left_at() {
    let (storage, alice, bob, group) = seeded().await;
    let chat = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    let first_leave = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    storage
        .mark_participant_left(chat.id, bob, first_leave)
        .await
        .expect("leave");
    let again = storage
        .mark_participant_left(chat.id, bob, first_leave + Duration::days(3))
        .await
        .expect("leave")
        .expect("participant");
    assert_eq!(again.left_at, Some(first_leave));
}

#[tokio::test]
async fn insert_participant_is_noop_when_row_exists() {
    let (storage, alice, bob, group) = seeded().await;
    let chat = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    let inserted = storage
        .insert_participant(chat.id, alice, Utc::now())
        .await
        .expect("insert participant");
    assert!(inserted.is_none());
}

#[tokio::test]
async fn messages_are_listed_from_cutoff_in_order() {
    let (storage, alice, bob, group) = seeded().await;
    let chat = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    let first = storage
        .insert_message(chat.id, alice, "first", Utc::now())
        .await
        .expect("first");
    let second = storage
        .insert_message(chat.id, bob, "second", Utc::now())
        .await
        .expect("second");

    let all = storage.list_messages(chat.id, None).await.expect("all");
    assert_eq!(
        all.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );

    let tail = storage
        .list_messages(chat.id, Some(second.created_at))
        .await
        .expect("tail");
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].content, "second");
}

#[tokio::test]
async fn message_timestamp_never_precedes_active_join() {
    let (storage, alice, bob, group) = seeded().await;
    let chat = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    let future = Utc::now() + Duration::minutes(5);
    let bob_row = storage
        .reactivate_participant(chat.id, bob, future)
        .await
        .expect("rejoin")
        .expect("participant");

    let message = storage
        .insert_message(chat.id, alice, "hello", Utc::now())
        .await
        .expect("message");
    assert!(message.created_at >= bob_row.joined_at);

    let updated = storage
        .load_direct_chat(chat.id)
        .await
        .expect("load")
        .expect("chat");
    assert_eq!(updated.updated_at, message.created_at);
}

#[tokio::test]
async fn unread_counts_respect_read_marker_and_sender() {
    let (storage, alice, bob, group) = seeded().await;
    let chat = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    storage
        .insert_message(chat.id, alice, "one", Utc::now())
        .await
        .expect("one");
    storage
        .insert_message(chat.id, alice, "two", Utc::now())
        .await
        .expect("two");
    storage
        .insert_message(chat.id, bob, "reply", Utc::now())
        .await
        .expect("reply");

    let bob_unread = storage.unread_counts(bob).await.expect("unread");
    assert_eq!(
        bob_unread,
        vec![UnreadCount {
            conversation_id: chat.id,
            unread: 2
        }]
    );

    storage
        .mark_read(chat.id, bob, Utc::now())
        .await
        .expect("mark read");
    let bob_unread = storage.unread_counts(bob).await.expect("unread");
    assert_eq!(bob_unread[0].unread, 0);

    let alice_unread = storage.unread_counts(alice).await.expect("unread");
    assert_eq!(alice_unread[0].unread, 1);
}

#[tokio::test]
async fn departed_participants_drop_out_of_listing_and_unread() {
    let (storage, alice, bob, group) = seeded().await;
    let chat = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    storage
        .mark_participant_left(chat.id, bob, Utc::now())
        .await
        .expect("leave");

    assert!(storage
        .list_direct_chats_for_user(bob)
        .await
        .expect("list")
        .is_empty());
    assert!(storage.unread_counts(bob).await.expect("unread").is_empty());
    assert_eq!(
        storage
            .list_direct_chats_for_user(alice)
            .await
            .expect("list")
            .len(),
        1
    );
}

#[tokio::test]
async fn deleting_chat_removes_dependents() {
    let (storage, alice, bob, group) = seeded().await;
    let chat = storage
        .insert_direct_chat(group, alice, bob, Utc::now())
        .await
        .expect("insert")
        .expect("created");
    storage
        .insert_message(chat.id, alice, "bye", Utc::now())
        .await
        .expect("message");

    assert!(storage.delete_direct_chat(chat.id).await.expect("delete"));
    assert!(storage
        .load_participant(chat.id, alice)
        .await
        .expect("load")
        .is_none());
    assert!(storage
        .list_messages(chat.id, None)
        .await
        .expect("list")
        .is_empty());
    assert!(!storage.delete_direct_chat(chat.id).await.expect("delete"));
}

#[tokio::test]
async fn likes_are_unique_per_user_and_target() {
    let (storage, alice, bob, group) = seeded().await;
    let post = storage
        .create_group_post(group, alice, "trail report")
        .await
        .expect("post");
    let target = LikeTarget::GroupPost(post);

    assert!(storage.insert_like(target, bob).await.expect("like"));
    assert!(!storage.insert_like(target, bob).await.expect("like again"));
    assert!(storage.insert_like(target, alice).await.expect("like"));

    let state = storage.like_state(target, bob).await.expect("state");
    assert!(state.liked);
    assert_eq!(state.count, 2);

    assert!(storage.delete_like(target, bob).await.expect("unlike"));
    assert!(!storage.delete_like(target, bob).await.expect("unlike again"));
    let state = storage.like_state(target, bob).await.expect("state");
    assert!(!state.liked);
    assert_eq!(state.count, 1);
}

#[tokio::test]
async fn review_likes_live_in_their_own_table() {
    let (storage, alice, bob, group) = seeded().await;
    let post = storage
        .create_group_post(group, alice, "meetup notes")
        .await
        .expect("post");
    let review = storage
        .create_review(group, bob, 5, "great host")
        .await
        .expect("review");
    storage
        .insert_like(LikeTarget::Review(review), alice)
        .await
        .expect("like");

    let review_state = storage
        .like_state(LikeTarget::Review(review), alice)
        .await
        .expect("state");
    assert_eq!(review_state.count, 1);
    let post_state = storage
        .like_state(LikeTarget::GroupPost(post), alice)
        .await
        .expect("state");
    assert_eq!(post_state.count, 0);

    assert_eq!(
        storage
            .group_for_like_target(LikeTarget::Review(review))
            .await
            .expect("group"),
        Some(group)
    );
}
