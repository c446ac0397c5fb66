use super::*;

async fn setup() -> (ApiContext, UserId, UserId, GroupId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice").await.expect("user");
    let bob = storage.create_user("bob").await.expect("user");
    let group = storage.create_group("climbers", alice).await.expect("group");
    (ApiContext { storage }, alice, bob, group)
}

fn pair(group_id: GroupId, host_id: UserId, member_id: UserId) -> CreateConversationRequest {
    CreateConversationRequest {
        group_id,
        host_id,
        member_id,
    }
}

#[tokio::test]
async fn conversation_with_oneself_is_rejected() {
    let (ctx, alice, _, group) = setup().await;
    let err = create_conversation(&ctx, &pair(group, alice, alice))
        .await
        .expect_err("self chat");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn duplicate_pair_conflicts_in_either_order() {
    let (ctx, alice, bob, group) = setup().await;
    let created = create_conversation(&ctx, &pair(group, alice, bob))
        .await
        .expect("create");
    assert_eq!(created.changes.len(), 2);

    let err = create_conversation(&ctx, &pair(group, bob, alice))
        .await
        .expect_err("duplicate");
    assert_eq!(err.code, ErrorCode::Conflict);

    let found = find_conversation(&ctx, group, bob, alice)
        .await
        .expect("lookup");
    assert_eq!(found.id, created.value.id);
}

#[tokio::test]
async fn leave_and_rejoin_carry_before_images() {
    let (ctx, alice, bob, group) = setup().await;
    let conversation = create_conversation(&ctx, &pair(group, alice, bob))
        .await
        .expect("create")
        .value;

    let left = leave_conversation(&ctx, conversation.id, bob)
        .await
        .expect("leave");
    let [RealtimeEvent::ParticipantChanged { old: Some(old), new }] = left.changes.as_slice() else {
        panic!("expected one participant change: {:?}", left.changes);
    };
    assert!(old.is_active());
    assert!(!new.is_active());

    let back = rejoin_participant(&ctx, conversation.id, bob)
        .await
        .expect("rejoin");
    assert!(back.value.is_active());
    assert!(back.value.joined_at > old.joined_at);
}

#[tokio::test]
async fn outsiders_cannot_join_or_send() {
    let (ctx, alice, bob, group) = setup().await;
    let carol = ctx.storage.create_user("carol").await.expect("user");
    let conversation = create_conversation(&ctx, &pair(group, alice, bob))
        .await
        .expect("create")
        .value;

    let err = create_participant(&ctx, conversation.id, carol)
        .await
        .expect_err("outsider");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = send_message(
        &ctx,
        conversation.id,
        &SendMessageRequest {
            sender_id: carol,
            content: "hi".into(),
        },
    )
    .await
    .expect_err("outsider send");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = create_participant(&ctx, conversation.id, bob)
        .await
        .expect_err("already present");
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[tokio::test]
async fn message_is_trimmed_and_listed_since_cutoff() {
    let (ctx, alice, bob, group) = setup().await;
    let conversation = create_conversation(&ctx, &pair(group, alice, bob))
        .await
        .expect("create")
        .value;

    let sent = send_message(
        &ctx,
        conversation.id,
        &SendMessageRequest {
            sender_id: alice,
            content: "  see you at the crag  ".into(),
        },
    )
    .await
    .expect("send");
    assert_eq!(sent.value.content, "see you at the crag");

    let all = list_messages(&ctx, conversation.id, None).await.expect("list");
    assert_eq!(all.len(), 1);
    let later = list_messages(
        &ctx,
        conversation.id,
        Some(sent.value.created_at.timestamp_micros() + 1),
    )
    .await
    .expect("list");
    assert!(later.is_empty());

    let err = list_messages(&ctx, conversation.id, Some(i64::MAX))
        .await
        .expect_err("out of range");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn unread_subset_is_parsed_and_filtered() {
    let (ctx, alice, bob, group) = setup().await;
    let conversation = create_conversation(&ctx, &pair(group, alice, bob))
        .await
        .expect("create")
        .value;
    send_message(
        &ctx,
        conversation.id,
        &SendMessageRequest {
            sender_id: alice,
            content: "ping".into(),
        },
    )
    .await
    .expect("send");

    let counts = unread_counts(&ctx, bob, Some(&conversation.id.to_string()))
        .await
        .expect("unread");
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].unread, 1);

    let none = unread_counts(&ctx, bob, Some("999"))
        .await
        .expect("unread");
    assert!(none.is_empty());

    let err = unread_counts(&ctx, bob, Some("1,x"))
        .await
        .expect_err("bad id");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(parse_conversation_ids(Some(" ")).expect("blank"), None);
}

#[tokio::test]
async fn likes_require_known_target_and_kind() {
    let (ctx, alice, bob, group) = setup().await;
    let post = create_post(
        &ctx,
        group,
        &CreatePostRequest {
            author_id: alice,
            content: "new route opened".into(),
        },
    )
    .await
    .expect("post");
    let target = parse_like_target("group_post", post.0).expect("kind");

    assert!(add_like(&ctx, target, bob).await.expect("like"));
    assert!(!add_like(&ctx, target, bob).await.expect("like again"));
    let state = like_state(&ctx, target, bob).await.expect("state");
    assert_eq!((state.liked, state.count), (true, 1));
    assert!(remove_like(&ctx, target, bob).await.expect("unlike"));

    let missing = parse_like_target("review", 42).expect("kind");
    assert_eq!(
        like_state(&ctx, missing, bob).await.expect_err("missing").code,
        ErrorCode::NotFound
    );
    assert_eq!(
        parse_like_target("photo", 1).expect_err("kind").code,
        ErrorCode::Validation
    );
}

#[tokio::test]
async fn review_rating_is_bounded() {
    let (ctx, alice, _, group) = setup().await;
    let err = create_review(
        &ctx,
        group,
        &CreateReviewRequest {
            author_id: alice,
            rating: 6,
            content: "too good".into(),
        },
    )
    .await
    .expect_err("rating");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = create_user(&ctx, "   ").await.expect_err("blank name");
    assert_eq!(err.code, ErrorCode::Validation);
}
