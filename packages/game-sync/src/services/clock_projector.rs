use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::clock::elapsed_seconds;
use crate::models::game::{Game, GameStatus, Side};
use crate::services::game_sync_service::GameSyncClient;

/// Clocks as they should read right now, extrapolated from the last known state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockProjection {
    pub white_time_remaining: u32,
    pub black_time_remaining: u32,
    /// The side whose clock reached zero, if any.
    pub flag_fall: Option<Side>,
}

/// Charges the side to move for the whole seconds since `anchor`. Games that
/// are not active keep their stored clocks.
pub fn project(game: &Game, anchor: DateTime<Utc>, now: DateTime<Utc>) -> ClockProjection {
    let mut projection = ClockProjection {
        white_time_remaining: game.white_time_remaining,
        black_time_remaining: game.black_time_remaining,
        flag_fall: None,
    };
    if game.status != GameStatus::Active {
        return projection;
    }

    let side = game.current_turn;
    let remaining = game
        .time_remaining(side)
        .saturating_sub(elapsed_seconds(anchor, now));
    match side {
        Side::White => projection.white_time_remaining = remaining,
        Side::Black => projection.black_time_remaining = remaining,
    }
    if remaining == 0 {
        projection.flag_fall = Some(side);
    }
    projection
}

/// Ticks the displayed clocks of one game and reports flag-fall.
pub struct ClockProjector {
    client: GameSyncClient,
    game_id: String,
    started_at: DateTime<Utc>,
    view: watch::Receiver<Option<Game>>,
    projections: watch::Sender<Option<ClockProjection>>,
    flagged_at: Option<DateTime<Utc>>,
}

impl ClockProjector {
    pub fn new(client: GameSyncClient, game_id: &str) -> Self {
        let started_at = client.clock().now();
        let view = client.watch(game_id);
        let (projections, _) = watch::channel(None);
        ClockProjector {
            client,
            game_id: game_id.to_string(),
            started_at,
            view,
            projections,
            flagged_at: None,
        }
    }

    pub fn projections(&self) -> watch::Receiver<Option<ClockProjection>> {
        self.projections.subscribe()
    }

    /// Projects the displayed game once. On flag-fall the game is shown as
    /// lost on time and the claim is sent to the store, once per stored state.
    pub async fn tick(&mut self) -> Option<ClockProjection> {
        let game = self.view.borrow_and_update().clone()?;
        let anchor = game.updated_at.max(self.started_at);
        let projection = project(&game, anchor, self.client.clock().now());
        self.projections.send_replace(Some(projection));

        if let Some(loser) = projection.flag_fall {
            if self.flagged_at != Some(game.updated_at) {
                self.flagged_at = Some(game.updated_at);
                info!("{} flagged in game {}", loser, self.game_id);
                self.client.declare_flag_fall(&game, loser);
                if let Err(e) = self.client.claim_flag_fall(&self.game_id).await {
                    warn!("Claiming flag-fall in game {} failed: {}", self.game_id, e);
                }
            }
        }
        Some(projection)
    }

    /// Runs [`tick`](Self::tick) on a fixed period until the handle is stopped or dropped.
    pub fn spawn(mut self, period: Duration) -> ClockProjectorHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        });
        ClockProjectorHandle { task }
    }
}

pub struct ClockProjectorHandle {
    task: JoinHandle<()>,
}

impl ClockProjectorHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ClockProjectorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
