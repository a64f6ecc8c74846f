use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{
    AttributeValue, CancellationReason, Put, ReturnValue, TransactWriteItem, Update,
};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use serde_dynamo::{from_item, to_attribute_value, to_item};
use tracing::{debug, info};

use crate::clock::next_timestamp;
use crate::config::SyncConfig;
use crate::models::game::{Game, GamePatch, GameStatus, Side};
use crate::models::game_move::Move;
use crate::repositories::errors::game_repository_errors::GameRepositoryError;

#[cfg(test)]
use mockall::automock;

/// Guard evaluated by the store atomically with an update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePrecondition {
    /// The game is neither completed nor abandoned.
    NotTerminal,
    /// The game is waiting and the seat for this side is empty.
    SeatOpen(Side),
    /// The game is active and still at exactly this position.
    ActiveAt { fen: String },
}

/// Everything the store needs to persist one ply atomically: the move row and
/// the game row update, guarded by the position the move was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveCommit {
    pub game_id: String,
    pub expected_fen: String,
    pub record: Move,
    pub patch: GamePatch,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait GameRepository: Send + Sync {
    async fn create_game(&self, game: &Game) -> Result<Game, GameRepositoryError>;

    async fn get_game(&self, game_id: &str) -> Result<Game, GameRepositoryError>;

    async fn update_game(
        &self,
        game_id: &str,
        patch: &GamePatch,
        precondition: &UpdatePrecondition,
    ) -> Result<Game, GameRepositoryError>;

    async fn commit_move(&self, commit: &MoveCommit) -> Result<Move, GameRepositoryError>;

    /// Moves with a move number greater than `after`, in order.
    async fn list_moves(&self, game_id: &str, after: u32)
        -> Result<Vec<Move>, GameRepositoryError>;

    /// Games where the player holds either seat, newest first.
    async fn list_games_for_player(&self, player_id: &str)
        -> Result<Vec<Game>, GameRepositoryError>;
}

pub struct DynamoDbGameRepository {
    pub client: Client,
    pub games_table: String,
    pub moves_table: String,
}

impl DynamoDbGameRepository {
    pub fn new(client: Client, config: &SyncConfig) -> Self {
        Self {
            client,
            games_table: config.games_table.clone(),
            moves_table: config.moves_table.clone(),
        }
    }

    fn game_key(game_id: &str) -> Result<AttributeValue, GameRepositoryError> {
        to_attribute_value(game_id).map_err(|e| GameRepositoryError::Serialization(e.to_string()))
    }

    async fn query_games_index(
        &self,
        index_name: &str,
        attribute: &str,
        player_id: &str,
    ) -> Result<Vec<Game>, GameRepositoryError> {
        let output = self
            .client
            .query()
            .table_name(&self.games_table)
            .index_name(index_name)
            .key_condition_expression("#player = :player_id")
            .expression_attribute_names("#player", attribute)
            .expression_attribute_values(":player_id", AttributeValue::S(player_id.to_string()))
            .send()
            .await
            .map_err(|e| GameRepositoryError::DynamoDb(e.to_string()))?;

        let mut games = Vec::new();
        for item in output.items.unwrap_or_default() {
            let game: Game =
                from_item(item).map_err(|e| GameRepositoryError::Serialization(e.to_string()))?;
            games.push(game);
        }
        Ok(games)
    }

    /// Stamp of the stored row, read strongly consistent.
    async fn stored_updated_at(&self, game_id: &str) -> Result<DateTime<Utc>, GameRepositoryError> {
        Ok(self.get_game(game_id).await?.updated_at)
    }
}

/// Copy of `patch` stamped after the stored row's `previous` stamp.
fn stamped(patch: &GamePatch, previous: DateTime<Utc>, now: DateTime<Utc>) -> GamePatch {
    let mut stamped = patch.clone();
    stamped.updated_at = Some(next_timestamp(previous, now));
    stamped
}

/// Condition that the row still carries the stamp the new one was derived from.
fn freshness_guard(
    previous: DateTime<Utc>,
    names: &mut HashMap<String, String>,
    values: &mut HashMap<String, AttributeValue>,
) -> Result<String, GameRepositoryError> {
    names.insert("#updated_at".to_string(), "updated_at".to_string());
    values.insert(
        ":previous_updated_at".to_string(),
        to_attribute_value(previous).map_err(|e| GameRepositoryError::Serialization(e.to_string()))?,
    );
    Ok("#updated_at = :previous_updated_at".to_string())
}

/// A cancelled transaction is a lost race only when one of its conditions failed.
/// Throttling and transaction conflicts are transient.
fn is_condition_failure(reasons: &[CancellationReason]) -> bool {
    reasons
        .iter()
        .any(|reason| reason.code() == Some("ConditionalCheckFailed"))
}

/// Translates a patch into a `SET` update expression with placeholder names and values.
fn update_expression(
    patch: &GamePatch,
) -> Result<
    (
        String,
        HashMap<String, String>,
        HashMap<String, AttributeValue>,
    ),
    GameRepositoryError,
> {
    let item: HashMap<String, AttributeValue> =
        to_item(patch).map_err(|e| GameRepositoryError::Serialization(e.to_string()))?;
    if item.is_empty() {
        return Err(GameRepositoryError::Rejected("empty update".to_string()));
    }

    let mut names = HashMap::new();
    let mut values = HashMap::new();
    let mut assignments = Vec::new();
    for (index, (field, value)) in item.into_iter().enumerate() {
        let name = format!("#f{}", index);
        let placeholder = format!(":v{}", index);
        assignments.push(format!("{} = {}", name, placeholder));
        names.insert(name, field);
        values.insert(placeholder, value);
    }

    Ok((format!("SET {}", assignments.join(", ")), names, values))
}

/// Adds the condition for `precondition` to the expression maps and returns it.
fn condition_expression(
    precondition: &UpdatePrecondition,
    names: &mut HashMap<String, String>,
    values: &mut HashMap<String, AttributeValue>,
) -> Result<String, GameRepositoryError> {
    let status = |status: GameStatus| {
        to_attribute_value(status).map_err(|e| GameRepositoryError::Serialization(e.to_string()))
    };
    names.insert("#status".to_string(), "status".to_string());

    let condition = match precondition {
        UpdatePrecondition::NotTerminal => {
            values.insert(":waiting".to_string(), status(GameStatus::Waiting)?);
            values.insert(":active".to_string(), status(GameStatus::Active)?);
            "attribute_exists(id) AND #status IN (:waiting, :active)".to_string()
        }
        UpdatePrecondition::SeatOpen(side) => {
            let seat = match side {
                Side::White => "white_player_id",
                Side::Black => "black_player_id",
            };
            names.insert("#seat".to_string(), seat.to_string());
            values.insert(":waiting".to_string(), status(GameStatus::Waiting)?);
            values.insert(":null_type".to_string(), AttributeValue::S("NULL".to_string()));
            "attribute_exists(id) AND #status = :waiting AND \
             (attribute_not_exists(#seat) OR attribute_type(#seat, :null_type))"
                .to_string()
        }
        UpdatePrecondition::ActiveAt { fen } => {
            names.insert("#fen".to_string(), "fen".to_string());
            values.insert(":active".to_string(), status(GameStatus::Active)?);
            values.insert(":expected_fen".to_string(), AttributeValue::S(fen.clone()));
            "attribute_exists(id) AND #status = :active AND #fen = :expected_fen".to_string()
        }
    };
    Ok(condition)
}

#[async_trait]
impl GameRepository for DynamoDbGameRepository {
    async fn create_game(&self, game: &Game) -> Result<Game, GameRepositoryError> {
        game.settings
            .validate()
            .map_err(GameRepositoryError::Rejected)?;

        let item = to_item(game).map_err(|e| GameRepositoryError::Serialization(e.to_string()))?;
        let result = self
            .client
            .put_item()
            .table_name(&self.games_table)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await;

        match result {
            Ok(_) => {
                info!("Created game {}", game.id);
                Ok(game.clone())
            }
            Err(e) => {
                if let SdkError::ServiceError(service_err) = &e {
                    if service_err.err().is_conditional_check_failed_exception() {
                        return Err(GameRepositoryError::Conflict(format!(
                            "game {} already exists",
                            game.id
                        )));
                    }
                }
                Err(GameRepositoryError::DynamoDb(e.to_string()))
            }
        }
    }

    async fn get_game(&self, game_id: &str) -> Result<Game, GameRepositoryError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.games_table)
            .key("id", Self::game_key(game_id)?)
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| GameRepositoryError::DynamoDb(e.to_string()))?;

        if let Some(item) = output.item {
            let game: Game =
                from_item(item).map_err(|e| GameRepositoryError::Serialization(e.to_string()))?;
            Ok(game)
        } else {
            Err(GameRepositoryError::NotFound)
        }
    }

    async fn update_game(
        &self,
        game_id: &str,
        patch: &GamePatch,
        precondition: &UpdatePrecondition,
    ) -> Result<Game, GameRepositoryError> {
        let previous = self.stored_updated_at(game_id).await?;
        let patch = stamped(patch, previous, Utc::now());

        let (update, mut names, mut values) = update_expression(&patch)?;
        let condition = format!(
            "{} AND {}",
            condition_expression(precondition, &mut names, &mut values)?,
            freshness_guard(previous, &mut names, &mut values)?
        );
        debug!("Updating game {} with {}", game_id, update);

        let result = self
            .client
            .update_item()
            .table_name(&self.games_table)
            .key("id", Self::game_key(game_id)?)
            .update_expression(update)
            .condition_expression(condition)
            .set_expression_attribute_names(Some(names))
            .set_expression_attribute_values(Some(values))
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => {
                let attributes = output.attributes.ok_or(GameRepositoryError::NotFound)?;
                from_item(attributes).map_err(|e| GameRepositoryError::Serialization(e.to_string()))
            }
            Err(e) => {
                if let SdkError::ServiceError(service_err) = &e {
                    if service_err.err().is_conditional_check_failed_exception() {
                        return Err(GameRepositoryError::Conflict(format!(
                            "game {} no longer satisfies {:?}",
                            game_id, precondition
                        )));
                    }
                }
                Err(GameRepositoryError::DynamoDb(e.to_string()))
            }
        }
    }

    async fn commit_move(&self, commit: &MoveCommit) -> Result<Move, GameRepositoryError> {
        let previous = self.stored_updated_at(&commit.game_id).await?;
        let patch = stamped(&commit.patch, previous, Utc::now());

        let move_item =
            to_item(&commit.record).map_err(|e| GameRepositoryError::Serialization(e.to_string()))?;
        let (update, mut names, mut values) = update_expression(&patch)?;
        let condition = format!(
            "{} AND {}",
            condition_expression(
                &UpdatePrecondition::ActiveAt {
                    fen: commit.expected_fen.clone(),
                },
                &mut names,
                &mut values,
            )?,
            freshness_guard(previous, &mut names, &mut values)?
        );

        let transaction_items = vec![
            // The move number is the sort key, so a second writer for the same ply fails here
            TransactWriteItem::builder()
                .put(
                    Put::builder()
                        .table_name(&self.moves_table)
                        .set_item(Some(move_item))
                        .condition_expression("attribute_not_exists(move_number)")
                        .build()
                        .map_err(|e| GameRepositoryError::DynamoDb(e.to_string()))?,
                )
                .build(),
            TransactWriteItem::builder()
                .update(
                    Update::builder()
                        .table_name(&self.games_table)
                        .key("id", Self::game_key(&commit.game_id)?)
                        .update_expression(update)
                        .condition_expression(condition)
                        .set_expression_attribute_names(Some(names))
                        .set_expression_attribute_values(Some(values))
                        .build()
                        .map_err(|e| GameRepositoryError::DynamoDb(e.to_string()))?,
                )
                .build(),
        ];

        let result = self
            .client
            .transact_write_items()
            .set_transact_items(Some(transaction_items))
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(
                    "Committed move {} ({}) for game {}",
                    commit.record.move_number, commit.record.move_text, commit.game_id
                );
                Ok(commit.record.clone())
            }
            Err(e) => {
                if let SdkError::ServiceError(service_err) = &e {
                    if let TransactWriteItemsError::TransactionCanceledException(canceled) =
                        service_err.err()
                    {
                        if is_condition_failure(canceled.cancellation_reasons()) {
                            return Err(GameRepositoryError::Conflict(format!(
                                "move {} for game {} was submitted against an outdated position",
                                commit.record.move_number, commit.game_id
                            )));
                        }
                    }
                }
                Err(GameRepositoryError::DynamoDb(e.to_string()))
            }
        }
    }

    async fn list_moves(
        &self,
        game_id: &str,
        after: u32,
    ) -> Result<Vec<Move>, GameRepositoryError> {
        let mut moves = Vec::new();
        let mut start_key = None;

        loop {
            let output = self
                .client
                .query()
                .table_name(&self.moves_table)
                .key_condition_expression("game_id = :game_id AND move_number > :after")
                .expression_attribute_values(":game_id", AttributeValue::S(game_id.to_string()))
                .expression_attribute_values(":after", AttributeValue::N(after.to_string()))
                .scan_index_forward(true)
                .consistent_read(true)
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| GameRepositoryError::DynamoDb(e.to_string()))?;

            for item in output.items.unwrap_or_default() {
                let mv: Move = from_item(item)
                    .map_err(|e| GameRepositoryError::Serialization(e.to_string()))?;
                moves.push(mv);
            }

            match output.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        moves.sort_by_key(|mv| mv.move_number);
        Ok(moves)
    }

    async fn list_games_for_player(
        &self,
        player_id: &str,
    ) -> Result<Vec<Game>, GameRepositoryError> {
        let mut games = self
            .query_games_index("GSI_GamesByWhitePlayer", "white_player_id", player_id)
            .await?;
        for game in self
            .query_games_index("GSI_GamesByBlackPlayer", "black_player_id", player_id)
            .await?
        {
            if !games.iter().any(|existing| existing.id == game.id) {
                games.push(game);
            }
        }

        games.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(games)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::game::{GameResult, GameSettings};
    use chrono::Duration;
    use test_case::test_case;

    fn reasons(codes: &[&str]) -> Vec<CancellationReason> {
        codes
            .iter()
            .map(|code| CancellationReason::builder().code(*code).build())
            .collect()
    }

    #[test]
    fn test_update_expression_lists_only_present_fields() {
        let patch = GamePatch {
            fen: Some("8/8/8/8/8/8/8/K6k w - - 0 1".to_string()),
            current_turn: Some(Side::White),
            ..Default::default()
        };

        let (expression, names, values) = update_expression(&patch).unwrap();

        assert!(expression.starts_with("SET "));
        assert_eq!(names.len(), 2);
        assert_eq!(values.len(), 2);
        let mut fields: Vec<&String> = names.values().collect();
        fields.sort();
        assert_eq!(fields, vec!["current_turn", "fen"]);
    }

    #[test]
    fn test_update_expression_rejects_empty_patch() {
        let result = update_expression(&GamePatch::default());

        assert!(matches!(result, Err(GameRepositoryError::Rejected(_))));
    }

    #[test]
    fn test_condition_expression_for_active_position() {
        let mut names = HashMap::new();
        let mut values = HashMap::new();

        let condition = condition_expression(
            &UpdatePrecondition::ActiveAt {
                fen: "fen-before".to_string(),
            },
            &mut names,
            &mut values,
        )
        .unwrap();

        assert!(condition.contains("#fen = :expected_fen"));
        assert_eq!(
            values.get(":expected_fen"),
            Some(&AttributeValue::S("fen-before".to_string()))
        );
        assert_eq!(
            values.get(":active"),
            Some(&AttributeValue::S("active".to_string()))
        );
    }

    #[test]
    fn test_condition_expression_for_open_seat() {
        let mut names = HashMap::new();
        let mut values = HashMap::new();

        let condition =
            condition_expression(&UpdatePrecondition::SeatOpen(Side::Black), &mut names, &mut values)
                .unwrap();

        assert!(condition.contains("attribute_not_exists(#seat)"));
        assert_eq!(names.get("#seat").map(String::as_str), Some("black_player_id"));
    }

    #[test]
    fn test_completed_patch_serializes_for_update() {
        let patch = GamePatch::completed(GameResult::Abandoned, Some("winner".to_string()));

        let (_, names, _) = update_expression(&patch).unwrap();

        let mut fields: Vec<&String> = names.values().collect();
        fields.sort();
        assert_eq!(fields, vec!["result", "status", "winner_id"]);
    }

    #[test]
    fn test_game_item_round_trips_through_dynamo_format() {
        let game = Game::new("player1", Side::White, GameSettings::new(600, 0));

        let item: HashMap<String, AttributeValue> = to_item(&game).unwrap();
        let restored: Game = from_item(item).unwrap();

        assert_eq!(restored, game);
    }

    #[test]
    fn test_open_seat_is_left_out_of_item() {
        let game = Game::new("player1", Side::White, GameSettings::new(600, 0));

        let item: HashMap<String, AttributeValue> = to_item(&game).unwrap();

        assert_eq!(
            item.get("white_player_id"),
            Some(&AttributeValue::S("player1".to_string()))
        );
        assert!(!item.contains_key("black_player_id"));
        let restored: Game = from_item(item).unwrap();
        assert_eq!(restored.black_player_id, None);
    }

    #[test]
    fn test_stamp_follows_stored_row_when_writer_clock_lags() {
        let previous = Utc::now();
        let patch = GamePatch {
            fen: Some("after".to_string()),
            ..Default::default()
        };

        let lagging = stamped(&patch, previous, previous - Duration::seconds(5));
        let ahead = stamped(&patch, previous, previous + Duration::seconds(5));

        assert_eq!(lagging.updated_at, Some(previous + Duration::milliseconds(1)));
        assert_eq!(ahead.updated_at, Some(previous + Duration::seconds(5)));
        assert_eq!(lagging.fen, patch.fen);
    }

    #[test]
    fn test_freshness_guard_pins_previous_stamp() {
        let previous = Utc::now();
        let mut names = HashMap::new();
        let mut values = HashMap::new();

        let guard = freshness_guard(previous, &mut names, &mut values).unwrap();

        assert_eq!(guard, "#updated_at = :previous_updated_at");
        assert_eq!(names.get("#updated_at").map(String::as_str), Some("updated_at"));
        assert_eq!(
            values.get(":previous_updated_at"),
            Some(&to_attribute_value(previous).unwrap())
        );
    }

    #[test_case(&["None", "ConditionalCheckFailed"], true ; "stale position")]
    #[test_case(&["ConditionalCheckFailed", "None"], true ; "move number taken")]
    #[test_case(&["ThrottlingError", "None"], false ; "throttled")]
    #[test_case(&["None", "TransactionConflict"], false ; "concurrent transaction")]
    #[test_case(&[], false ; "no reasons")]
    fn test_only_failed_conditions_count_as_conflict(codes: &[&str], expected: bool) {
        assert_eq!(is_condition_failure(&reasons(codes)), expected);
    }
}
