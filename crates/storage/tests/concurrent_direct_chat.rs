use chrono::Utc;
use storage::Storage;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_inserts_for_one_pair_leave_a_single_row() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}",
        temp_root
            .path()
            .join("race.db")
            .to_string_lossy()
            .replace('\\', "/")
    );
    let storage = Storage::new(&database_url).await.expect("db");
    let alice = storage.create_user("race-alice").await.expect("alice");
    let bob = storage.create_user("race-bob").await.expect("bob");
    let group = storage.create_group("race", alice).await.expect("group");

    let mut handles = Vec::new();
    for attempt in 0..8 {
        let storage = storage.clone();
        let (host, member) = if attempt % 2 == 0 {
            (alice, bob)
        } else {
            (bob, alice)
        };
        handles.push(tokio::spawn(async move {
            storage
                .insert_direct_chat(group, host, member, Utc::now())
                .await
                .expect("insert")
        }));
    }

    let mut created = Vec::new();
    for handle in handles {
        if let Some(chat) = handle.await.expect("join") {
            created.push(chat);
        }
    }
    assert_eq!(created.len(), 1, "exactly one insert wins");

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM direct_chats")
        .fetch_one(storage.pool())
        .await
        .expect("count");
    assert_eq!(rows, 1);
}
