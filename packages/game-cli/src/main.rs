use std::error::Error;
use std::sync::Arc;

use aws_sdk_dynamodb::Client;
use clap::{Parser, Subcommand};
use game_sync::config::SyncConfig;
use game_sync::models::game::{GameSettings, Side};
use game_sync::repositories::change_feed::PollingChangeFeed;
use game_sync::repositories::game_repository::DynamoDbGameRepository;
use game_sync::repositories::user_repository::DynamoDbUserRepository;
use game_sync::services::auth_service::AuthSession;
use game_sync::services::change_feed_listener::ChangeFeedListener;
use game_sync::services::clock_projector::ClockProjector;
use game_sync::services::game_sync_service::GameSyncClient;
use game_sync::services::user_service::UserService;
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "game-cli")]
#[command(about = "Play and follow synchronized chess games", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Create a game and wait for an opponent
    Create {
        /// Seconds on each clock
        time_control: u32,

        /// Seconds added after each move
        #[arg(long, default_value = "0")]
        increment: u32,

        /// Side to play (white or black), random when omitted
        #[arg(long, value_parser = parse_side)]
        side: Option<Side>,
    },

    /// Take the open seat of a waiting game
    Join { game_id: String },

    /// Play a move, e.g. `move <game_id> e2 e4`
    Move {
        game_id: String,
        from: String,
        to: String,

        /// Promotion piece (q, r, b or n)
        #[arg(long)]
        promotion: Option<String>,
    },

    /// Abandon a game, awarding it to the opponent
    Resign {
        game_id: String,

        #[arg(value_parser = parse_side)]
        side: Side,
    },

    /// List the moves of a game
    Moves { game_id: String },

    /// List your games, newest first
    History {
        #[arg(long, default_value = "10")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show the highest rated players
    Leaderboard {
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Follow a game and its clocks until Ctrl-C
    Watch { game_id: String },
}

fn parse_side(value: &str) -> Result<Side, String> {
    value.to_lowercase().parse()
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_clock(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    let config = SyncConfig::from_env()?;
    let aws_config = aws_config::load_from_env().await;
    let dynamo = Client::new(&aws_config);

    if let Err(e) = run(cli.command, dynamo, config).await {
        error!("{}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(command: Commands, dynamo: Client, config: SyncConfig) -> Result<(), Box<dyn Error>> {
    let repository = Arc::new(DynamoDbGameRepository::new(dynamo.clone(), &config));
    let session = Arc::new(AuthSession::from_env()?);
    let client = GameSyncClient::new(repository.clone(), session);

    match command {
        Commands::Create {
            time_control,
            increment,
            side,
        } => {
            let settings = GameSettings::new(time_control, increment);
            let game = match side {
                Some(side) => client.create_game_as(settings, side).await?,
                None => client.create_game(settings).await?,
            };
            print_json(&game)?;
        }
        Commands::Join { game_id } => {
            print_json(&client.join_game(&game_id).await?)?;
        }
        Commands::Move {
            game_id,
            from,
            to,
            promotion,
        } => {
            let stored = client
                .make_move(&game_id, &from, &to, promotion.as_deref())
                .await?;
            print_json(&stored)?;
        }
        Commands::Resign { game_id, side } => {
            print_json(&client.abandon_game(&game_id, side).await?)?;
        }
        Commands::Moves { game_id } => {
            print_json(&client.get_game_moves(&game_id).await?)?;
        }
        Commands::History { limit, offset } => {
            print_json(&client.get_game_history(limit, offset).await?)?;
        }
        Commands::Leaderboard { limit } => {
            let users = UserService::new(Arc::new(DynamoDbUserRepository::new(dynamo, &config)));
            print_json(&users.get_leaderboard(limit).await?)?;
        }
        Commands::Watch { game_id } => watch(&client, repository, &config, &game_id).await?,
    }
    Ok(())
}

async fn watch(
    client: &GameSyncClient,
    repository: Arc<DynamoDbGameRepository>,
    config: &SyncConfig,
    game_id: &str,
) -> Result<(), Box<dyn Error>> {
    let feed = Arc::new(PollingChangeFeed::new(repository, config.feed_poll_interval));
    let listener = ChangeFeedListener::new(feed, client.clone());
    let subscription = listener.attach(game_id).await?;
    let mut view = client.watch(game_id);
    client.get_game(game_id).await?;

    let projector = ClockProjector::new(client.clone(), game_id);
    let mut clocks = projector.projections();
    let ticking = projector.spawn(config.clock_tick);
    info!("Watching game {}, press Ctrl-C to stop", game_id);

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let game = view.borrow_and_update().clone();
                if let Some(game) = game {
                    print_json(&game)?;
                }
            }
            changed = clocks.changed() => {
                if changed.is_err() {
                    break;
                }
                let projection = *clocks.borrow_and_update();
                if let Some(projection) = projection {
                    info!(
                        "white {} black {}",
                        format_clock(projection.white_time_remaining),
                        format_clock(projection.black_time_remaining)
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ticking.stop();
    drop(view);
    subscription.unsubscribe().await;
    Ok(())
}
