use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{GroupId, LikeKind, LikeTarget, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/mori.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
    },
    CreateGroup {
        owner_user_id: i64,
        name: String,
    },
    CreatePost {
        group_id: i64,
        author_user_id: i64,
        content: String,
    },
    CreateReview {
        group_id: i64,
        author_user_id: i64,
        rating: u8,
        content: String,
    },
    /// Prints like totals for a post or review as seen by one user.
    Likes {
        kind: String,
        target_id: i64,
        #[arg(long, default_value_t = 0)]
        viewer_user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username } => {
            let user_id = storage.create_user(&username).await?;
            println!("created user_id={}", user_id.0);
        }
        Command::CreateGroup {
            owner_user_id,
            name,
        } => {
            let group_id = storage.create_group(&name, UserId(owner_user_id)).await?;
            println!("created group_id={}", group_id.0);
        }
        Command::CreatePost {
            group_id,
            author_user_id,
            content,
        } => {
            let post_id = storage
                .create_group_post(GroupId(group_id), UserId(author_user_id), &content)
                .await?;
            println!("created post_id={}", post_id.0);
        }
        Command::CreateReview {
            group_id,
            author_user_id,
            rating,
            content,
        } => {
            if !(1..=5).contains(&rating) {
                bail!("rating must be between 1 and 5");
            }
            let review_id = storage
                .create_review(GroupId(group_id), UserId(author_user_id), rating, &content)
                .await?;
            println!("created review_id={}", review_id.0);
        }
        Command::Likes {
            kind,
            target_id,
            viewer_user_id,
        } => {
            let Some(kind) = LikeKind::parse(&kind) else {
                bail!("unknown like kind '{kind}'");
            };
            let state = storage
                .like_state(LikeTarget::new(kind, target_id), UserId(viewer_user_id))
                .await?;
            println!("count={} liked={}", state.count, state.liked);
        }
    }

    Ok(())
}
