use chess::{Board, BoardStatus, ChessMove, Color, MoveGen, Piece, Square};
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::clock::elapsed_seconds;
use crate::models::game::{
    CapturedPieces, Game, GamePatch, GameResult, GameStatus, Side, STARTING_FEN,
};
use crate::models::game_move::Move;
use crate::models::move_request::MoveRequest;
use crate::services::errors::chess_service_errors::ChessServiceError;

/// Halfmoves without a pawn move or capture after which the game is drawn.
const FIFTY_MOVE_LIMIT: u32 = 100;

/// Outcome of applying one legal move to a game.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMove {
    pub mover: Side,
    pub move_number: u32,
    pub san: String,
    pub captured: Option<String>,
    pub fen: String,
    pub pgn: String,
    pub next_turn: Side,
    pub outcome: Option<GameResult>,
    pub winner_id: Option<String>,
    pub white_time_remaining: u32,
    pub black_time_remaining: u32,
    pub captured_pieces: CapturedPieces,
}

impl AppliedMove {
    /// The game row update that persists this move.
    pub fn patch(&self) -> GamePatch {
        let mut patch = GamePatch {
            current_turn: Some(self.next_turn),
            fen: Some(self.fen.clone()),
            pgn: Some(self.pgn.clone()),
            white_time_remaining: Some(self.white_time_remaining),
            black_time_remaining: Some(self.black_time_remaining),
            captured_pieces: Some(self.captured_pieces.clone()),
            ..Default::default()
        };
        if let Some(result) = self.outcome {
            patch.status = Some(GameStatus::Completed);
            patch.result = Some(result);
            patch.winner_id = self.winner_id.clone();
        }
        patch
    }
}

struct Played {
    san: String,
    captured: Option<Piece>,
    fen: String,
    halfmove: u32,
    board: Board,
}

#[derive(Clone, Default)]
pub struct ChessService;

impl ChessService {
    pub fn new() -> Self {
        ChessService
    }

    /// Validates `request` for `player_id` against `game` as of `now` and
    /// computes the resulting state. Never touches the store.
    pub fn apply_move(
        &self,
        game: &Game,
        player_id: &str,
        request: &MoveRequest,
        now: DateTime<Utc>,
    ) -> Result<AppliedMove, ChessServiceError> {
        match game.status {
            GameStatus::Waiting => return Err(ChessServiceError::GameNotStarted),
            GameStatus::Completed | GameStatus::Abandoned => {
                return Err(ChessServiceError::GameOver(format!(
                    "game is {:?}",
                    game.status
                )))
            }
            GameStatus::Active => {}
        }

        let mover = match game.side_of(player_id) {
            Some(side) if side == game.current_turn => side,
            _ => return Err(ChessServiceError::NotYourTurn),
        };

        let elapsed = elapsed_seconds(game.updated_at, now);
        let remaining = game.time_remaining(mover);
        if elapsed >= remaining {
            return Err(ChessServiceError::GameOver("time expired".to_string()));
        }

        let from = parse_square(&request.from_square)?;
        let to = parse_square(&request.to_square)?;
        let board = parse_board(&game.fen)?;
        if side_of_color(board.side_to_move()) != mover {
            return Err(ChessServiceError::InvalidPosition(
                "side to move disagrees with current turn".to_string(),
            ));
        }
        if board.status() != BoardStatus::Ongoing {
            return Err(ChessServiceError::GameOver(
                "position is already decided".to_string(),
            ));
        }

        let promotion = match &request.promotion_piece {
            Some(piece) => Some(parse_promotion(piece)?),
            None if is_promotion_square(&board, from, to) => Some(Piece::Queen),
            None => None,
        };

        let chess_move = ChessMove::new(from, to, promotion);
        let legal_moves: Vec<ChessMove> = MoveGen::new_legal(&board).collect();
        if !legal_moves.contains(&chess_move) {
            return Err(ChessServiceError::IllegalMove(format!(
                "{}{} is not legal",
                request.from_square, request.to_square
            )));
        }

        let (halfmove, fullmove) = move_counters(&game.fen);
        let played = play(&board, chess_move, halfmove, fullmove);

        let mut captured_pieces = game.captured_pieces.clone();
        let captured = played.captured.map(|piece| {
            let letter = piece_letter(piece).to_ascii_lowercase().to_string();
            captured_pieces.record(mover, &letter);
            letter
        });

        let outcome = match played.board.status() {
            BoardStatus::Checkmate => Some(GameResult::Checkmate),
            BoardStatus::Stalemate => Some(GameResult::Stalemate),
            BoardStatus::Ongoing if played.halfmove >= FIFTY_MOVE_LIMIT => Some(GameResult::Draw),
            BoardStatus::Ongoing => None,
        };
        let winner_id = match outcome {
            Some(GameResult::Checkmate) => Some(player_id.to_string()),
            _ => None,
        };

        let mover_clock = remaining - elapsed + game.settings.increment;
        let (white_time_remaining, black_time_remaining) = match mover {
            Side::White => (mover_clock, game.black_time_remaining),
            Side::Black => (game.white_time_remaining, mover_clock),
        };

        Ok(AppliedMove {
            mover,
            move_number: move_number(&game.fen),
            pgn: append_pgn(game.pgn.as_deref(), fullmove, mover, &played.san),
            san: played.san,
            captured,
            fen: played.fen,
            next_turn: mover.opponent(),
            outcome,
            winner_id,
            white_time_remaining,
            black_time_remaining,
            captured_pieces,
        })
    }

    /// Replays persisted moves from the initial position and returns the
    /// resulting FEN. Fails on gaps in numbering or unknown move text.
    pub fn replay(&self, moves: &[Move]) -> Result<String, ChessServiceError> {
        let mut board = parse_board(STARTING_FEN)?;
        let mut fen = STARTING_FEN.to_string();
        for (index, mv) in moves.iter().enumerate() {
            if mv.move_number as usize != index + 1 {
                return Err(ChessServiceError::InvalidPosition(format!(
                    "expected move {} but found {}",
                    index + 1,
                    mv.move_number
                )));
            }
            let chess_move = MoveGen::new_legal(&board)
                .find(|candidate| san(&board, *candidate) == mv.move_text)
                .ok_or_else(|| ChessServiceError::IllegalMove(mv.move_text.clone()))?;
            let (halfmove, fullmove) = move_counters(&fen);
            let played = play(&board, chess_move, halfmove, fullmove);
            board = played.board;
            fen = played.fen;
        }
        Ok(fen)
    }

    /// Legal moves in coordinate notation, for move hints.
    pub fn legal_moves(&self, fen: &str) -> Result<Vec<String>, ChessServiceError> {
        let board = parse_board(fen)?;
        Ok(MoveGen::new_legal(&board)
            .map(|m| match m.get_promotion() {
                Some(piece) => format!(
                    "{}{}{}",
                    m.get_source(),
                    m.get_dest(),
                    piece_letter(piece).to_ascii_lowercase()
                ),
                None => format!("{}{}", m.get_source(), m.get_dest()),
            })
            .collect())
    }
}

/// One-based ply number of the next move in `fen`.
pub fn move_number(fen: &str) -> u32 {
    let (_, fullmove) = move_counters(fen);
    let black_to_move = fen.split_whitespace().nth(1) == Some("b");
    2 * (fullmove.max(1) - 1) + u32::from(black_to_move) + 1
}

fn play(board: &Board, chess_move: ChessMove, halfmove: u32, fullmove: u32) -> Played {
    let moved = board.piece_on(chess_move.get_source());
    let captured = captured_piece(board, chess_move);
    let san = san(board, chess_move);
    let next = board.make_move_new(chess_move);

    let halfmove = if moved == Some(Piece::Pawn) || captured.is_some() {
        0
    } else {
        halfmove + 1
    };
    let fullmove = if board.side_to_move() == Color::Black {
        fullmove + 1
    } else {
        fullmove
    };

    Played {
        san,
        captured,
        fen: with_counters(&next, halfmove, fullmove),
        halfmove,
        board: next,
    }
}

fn san(board: &Board, chess_move: ChessMove) -> String {
    let from = chess_move.get_source();
    let to = chess_move.get_dest();
    let piece = board.piece_on(from).unwrap_or(Piece::Pawn);
    let file_delta = to.get_file().to_index() as i32 - from.get_file().to_index() as i32;

    let mut text = if piece == Piece::King && file_delta.abs() == 2 {
        String::from(if file_delta > 0 { "O-O" } else { "O-O-O" })
    } else {
        let capture = captured_piece(board, chess_move).is_some();
        let mut text = String::new();
        if piece == Piece::Pawn {
            if capture {
                text.push(file_char(from));
                text.push('x');
            }
            text.push_str(&to.to_string());
            if let Some(promotion) = chess_move.get_promotion() {
                text.push('=');
                text.push(piece_letter(promotion));
            }
        } else {
            text.push(piece_letter(piece));
            text.push_str(&disambiguation(board, chess_move, piece));
            if capture {
                text.push('x');
            }
            text.push_str(&to.to_string());
        }
        text
    };

    let next = board.make_move_new(chess_move);
    if next.status() == BoardStatus::Checkmate {
        text.push('#');
    } else if next.checkers().popcnt() > 0 {
        text.push('+');
    }
    text
}

fn disambiguation(board: &Board, chess_move: ChessMove, piece: Piece) -> String {
    let from = chess_move.get_source();
    let rivals: Vec<Square> = MoveGen::new_legal(board)
        .filter(|m| {
            m.get_dest() == chess_move.get_dest()
                && m.get_source() != from
                && board.piece_on(m.get_source()) == Some(piece)
        })
        .map(|m| m.get_source())
        .collect();

    if rivals.is_empty() {
        String::new()
    } else if rivals.iter().all(|sq| sq.get_file() != from.get_file()) {
        file_char(from).to_string()
    } else if rivals.iter().all(|sq| sq.get_rank() != from.get_rank()) {
        rank_char(from).to_string()
    } else {
        from.to_string()
    }
}

fn captured_piece(board: &Board, chess_move: ChessMove) -> Option<Piece> {
    let from = chess_move.get_source();
    let to = chess_move.get_dest();
    match board.piece_on(to) {
        Some(piece) => Some(piece),
        // A pawn moving diagonally onto an empty square takes en passant.
        None if board.piece_on(from) == Some(Piece::Pawn) && from.get_file() != to.get_file() => {
            Some(Piece::Pawn)
        }
        None => None,
    }
}

fn append_pgn(existing: Option<&str>, fullmove: u32, mover: Side, san: &str) -> String {
    let existing = existing.unwrap_or("").trim();
    match (mover, existing.is_empty()) {
        (Side::White, true) => format!("{}. {}", fullmove, san),
        (Side::White, false) => format!("{} {}. {}", existing, fullmove, san),
        (Side::Black, true) => format!("{}... {}", fullmove, san),
        (Side::Black, false) => format!("{} {}", existing, san),
    }
}

/// Halfmove clock and fullmove number of a FEN, defaulting to a fresh game.
fn move_counters(fen: &str) -> (u32, u32) {
    let mut fields = fen.split_whitespace().skip(4);
    let halfmove = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
    let fullmove = fields.next().and_then(|f| f.parse().ok()).unwrap_or(1);
    (halfmove, fullmove)
}

fn with_counters(board: &Board, halfmove: u32, fullmove: u32) -> String {
    let rendered = board.to_string();
    let placement: Vec<&str> = rendered.split_whitespace().take(4).collect();
    format!("{} {} {}", placement.join(" "), halfmove, fullmove)
}

fn is_promotion_square(board: &Board, from: Square, to: Square) -> bool {
    board.piece_on(from) == Some(Piece::Pawn) && matches!(to.get_rank().to_index(), 0 | 7)
}

fn parse_board(fen: &str) -> Result<Board, ChessServiceError> {
    Board::from_str(fen).map_err(|e| ChessServiceError::InvalidPosition(format!("Invalid FEN: {}", e)))
}

fn parse_square(square: &str) -> Result<Square, ChessServiceError> {
    Square::from_str(&square.trim().to_ascii_lowercase())
        .map_err(|_| ChessServiceError::InvalidSquare(square.to_string()))
}

fn parse_promotion(piece: &str) -> Result<Piece, ChessServiceError> {
    match piece.to_ascii_lowercase().as_str() {
        "q" => Ok(Piece::Queen),
        "r" => Ok(Piece::Rook),
        "b" => Ok(Piece::Bishop),
        "n" => Ok(Piece::Knight),
        _ => Err(ChessServiceError::InvalidPromotion(piece.to_string())),
    }
}

fn piece_letter(piece: Piece) -> char {
    match piece {
        Piece::Pawn => 'P',
        Piece::Knight => 'N',
        Piece::Bishop => 'B',
        Piece::Rook => 'R',
        Piece::Queen => 'Q',
        Piece::King => 'K',
    }
}

fn file_char(square: Square) -> char {
    (b'a' + square.get_file().to_index() as u8) as char
}

fn rank_char(square: Square) -> char {
    (b'1' + square.get_rank().to_index() as u8) as char
}

fn side_of_color(color: Color) -> Side {
    match color {
        Color::White => Side::White,
        Color::Black => Side::Black,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::game::GameSettings;
    use proptest::prelude::*;
    use test_case::test_case;

    fn active_game() -> Game {
        let mut game = Game::new("white_player", Side::White, GameSettings::new(600, 0));
        game.black_player_id = Some("black_player".to_string());
        game.status = GameStatus::Active;
        game
    }

    fn game_at(fen: &str) -> Game {
        let mut game = active_game();
        game.fen = fen.to_string();
        game.current_turn = if fen.split_whitespace().nth(1) == Some("b") {
            Side::Black
        } else {
            Side::White
        };
        game
    }

    fn request(from: &str, to: &str) -> MoveRequest {
        MoveRequest::new("game".to_string(), from.to_string(), to.to_string())
    }

    fn player_for(game: &Game) -> String {
        game.player_id(game.current_turn).unwrap().to_string()
    }

    #[test]
    fn test_apply_opening_move() {
        let game = active_game();
        let service = ChessService::new();

        let applied = service
            .apply_move(&game, "white_player", &request("e2", "e4"), game.updated_at)
            .unwrap();

        assert_eq!(applied.san, "e4");
        assert_eq!(applied.move_number, 1);
        assert_eq!(applied.next_turn, Side::Black);
        assert_eq!(applied.pgn, "1. e4");
        assert_eq!(applied.white_time_remaining, 600);
        assert!(applied.outcome.is_none());
        assert!(applied.fen.ends_with(" b KQkq - 0 1") || applied.fen.ends_with(" b KQkq e3 0 1"));
    }

    #[test]
    fn test_off_board_square_is_rejected() {
        let game = active_game();

        let result =
            ChessService::new().apply_move(&game, "white_player", &request("e2", "e9"), game.updated_at);

        assert_eq!(result, Err(ChessServiceError::InvalidSquare("e9".to_string())));
    }

    #[test]
    fn test_wrong_player_is_rejected() {
        let game = active_game();

        let result =
            ChessService::new().apply_move(&game, "black_player", &request("e7", "e5"), game.updated_at);

        assert_eq!(result, Err(ChessServiceError::NotYourTurn));
    }

    #[test]
    fn test_illegal_move_is_rejected() {
        let game = active_game();

        let result =
            ChessService::new().apply_move(&game, "white_player", &request("e2", "e5"), game.updated_at);

        assert!(matches!(result, Err(ChessServiceError::IllegalMove(_))));
    }

    #[test]
    fn test_waiting_game_is_not_started() {
        let game = Game::new("white_player", Side::White, GameSettings::new(600, 0));

        let result =
            ChessService::new().apply_move(&game, "white_player", &request("e2", "e4"), game.updated_at);

        assert_eq!(result, Err(ChessServiceError::GameNotStarted));
    }

    #[test]
    fn test_expired_clock_rejects_move() {
        let game = active_game();
        let later = game.updated_at + chrono::Duration::seconds(600);

        let result = ChessService::new().apply_move(&game, "white_player", &request("e2", "e4"), later);

        assert_eq!(result, Err(ChessServiceError::GameOver("time expired".to_string())));
    }

    #[test]
    fn test_clock_charges_mover_and_adds_increment() {
        let mut game = active_game();
        game.settings.increment = 5;
        let later = game.updated_at + chrono::Duration::milliseconds(12_700);

        let applied = ChessService::new()
            .apply_move(&game, "white_player", &request("g1", "f3"), later)
            .unwrap();

        assert_eq!(applied.white_time_remaining, 600 - 12 + 5);
        assert_eq!(applied.black_time_remaining, 600);
        assert_eq!(applied.san, "Nf3");
    }

    #[test]
    fn test_fools_mate_is_checkmate() {
        let service = ChessService::new();
        let mut game = active_game();
        for (from, to) in [("f2", "f3"), ("e7", "e5"), ("g2", "g4"), ("d8", "h4")] {
            let player = player_for(&game);
            let applied = service
                .apply_move(&game, &player, &request(from, to), game.updated_at)
                .unwrap();
            game.apply_patch(&applied.patch());
            if applied.outcome.is_some() {
                assert_eq!(applied.san, "Qh4#");
                assert_eq!(applied.winner_id.as_deref(), Some("black_player"));
            }
        }

        assert_eq!(game.status, GameStatus::Completed);
        assert_eq!(game.result, Some(GameResult::Checkmate));
        assert_eq!(game.pgn.as_deref(), Some("1. f3 e5 2. g4 Qh4#"));
    }

    #[test]
    fn test_capture_records_piece_and_resets_halfmove() {
        let game = game_at("rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 3 2");

        let applied = ChessService::new()
            .apply_move(&game, "white_player", &request("e4", "d5"), game.updated_at)
            .unwrap();

        assert_eq!(applied.san, "exd5");
        assert_eq!(applied.captured.as_deref(), Some("p"));
        assert_eq!(applied.captured_pieces.white, vec!["p".to_string()]);
        assert!(applied.fen.ends_with(" 0 2"));
        assert_eq!(applied.move_number, 3);
    }

    #[test]
    fn test_castling_notation() {
        let game = game_at("r3k2r/pppq1ppp/2npbn2/2b1p3/2B1P3/2NPBN2/PPPQ1PPP/R3K2R w KQkq - 6 8");
        let service = ChessService::new();

        let short = service
            .apply_move(&game, "white_player", &request("e1", "g1"), game.updated_at)
            .unwrap();
        let long = service
            .apply_move(&game, "white_player", &request("e1", "c1"), game.updated_at)
            .unwrap();

        assert_eq!(short.san, "O-O");
        assert_eq!(long.san, "O-O-O");
        assert!(short.fen.ends_with(" 7 8"));
    }

    #[test]
    fn test_knight_disambiguation_by_file() {
        let game = game_at("4k3/8/8/8/8/8/8/1N2KN2 w - - 0 1");

        let applied = ChessService::new()
            .apply_move(&game, "white_player", &request("b1", "d2"), game.updated_at)
            .unwrap();

        assert_eq!(applied.san, "Nbd2");
    }

    #[test]
    fn test_en_passant_capture() {
        let game = game_at("rnbqkbnr/ppp1p1pp/8/3pPp2/8/8/PPPP1PPP/RNBQKBNR w KQkq f6 0 3");

        let applied = ChessService::new()
            .apply_move(&game, "white_player", &request("e5", "f6"), game.updated_at)
            .unwrap();

        assert_eq!(applied.san, "exf6");
        assert_eq!(applied.captured.as_deref(), Some("p"));
    }

    #[test_case(None, "e8=Q+" ; "defaults to queen")]
    #[test_case(Some("q"), "e8=Q+" ; "queen")]
    #[test_case(Some("r"), "e8=R+" ; "rook")]
    #[test_case(Some("n"), "e8=N" ; "knight")]
    #[test_case(Some("B"), "e8=B" ; "bishop uppercase")]
    fn test_promotion(piece: Option<&str>, expected: &str) {
        let game = game_at("7k/4P3/8/8/8/8/8/K7 w - - 0 40");
        let mut move_request = request("e7", "e8");
        move_request.promotion_piece = piece.map(str::to_string);

        let applied = ChessService::new()
            .apply_move(&game, "white_player", &move_request, game.updated_at)
            .unwrap();

        assert_eq!(applied.san, expected);
    }

    #[test]
    fn test_invalid_promotion_piece() {
        let game = game_at("7k/4P3/8/8/8/8/8/K7 w - - 0 40");
        let move_request = request("e7", "e8").with_promotion("k".to_string());

        let result =
            ChessService::new().apply_move(&game, "white_player", &move_request, game.updated_at);

        assert_eq!(result, Err(ChessServiceError::InvalidPromotion("k".to_string())));
    }

    #[test]
    fn test_fifty_move_rule_draws() {
        let game = game_at("4k3/8/8/8/8/8/8/4K1N1 w - - 99 80");

        let applied = ChessService::new()
            .apply_move(&game, "white_player", &request("g1", "f3"), game.updated_at)
            .unwrap();

        assert_eq!(applied.outcome, Some(GameResult::Draw));
        assert_eq!(applied.patch().status, Some(GameStatus::Completed));
        assert!(applied.winner_id.is_none());
    }

    #[test_case(STARTING_FEN, 1)]
    #[test_case("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1", 2)]
    #[test_case("rnbqkbnr/pppp1ppp/8/4p3/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2", 3)]
    #[test_case("4k3/8/8/8/8/8/8/4K3 b - - 10 31", 62)]
    fn test_move_number_from_fen(fen: &str, expected: u32) {
        assert_eq!(move_number(fen), expected);
    }

    #[test]
    fn test_black_first_pgn_uses_ellipsis() {
        assert_eq!(append_pgn(None, 12, Side::Black, "Kf7"), "12... Kf7");
        assert_eq!(append_pgn(Some("12... Kf7"), 13, Side::White, "Ke2"), "12... Kf7 13. Ke2");
    }

    #[test]
    fn test_replay_rejects_gaps() {
        let moves = vec![Move::new("g", "p", 2, "e4", "fen", None)];

        let result = ChessService::new().replay(&moves);

        assert!(matches!(result, Err(ChessServiceError::InvalidPosition(_))));
    }

    #[test]
    fn test_legal_moves_from_start() {
        let moves = ChessService::new().legal_moves(STARTING_FEN).unwrap();

        assert_eq!(moves.len(), 20);
        assert!(moves.contains(&"e2e4".to_string()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_replay_matches_applied_position(choices in proptest::collection::vec(any::<usize>(), 0..60)) {
            let service = ChessService::new();
            let mut game = active_game();
            let mut moves = Vec::new();

            for choice in choices {
                if game.status != GameStatus::Active {
                    break;
                }
                let board = Board::from_str(&game.fen).unwrap();
                let legal: Vec<ChessMove> = MoveGen::new_legal(&board).collect();
                let chosen = legal[choice % legal.len()];
                let mut move_request = request(
                    &chosen.get_source().to_string(),
                    &chosen.get_dest().to_string(),
                );
                move_request.promotion_piece = chosen
                    .get_promotion()
                    .map(|piece| piece_letter(piece).to_ascii_lowercase().to_string());

                let player = player_for(&game);
                let applied = service
                    .apply_move(&game, &player, &move_request, game.updated_at)
                    .unwrap();
                prop_assert_eq!(applied.move_number as usize, moves.len() + 1);
                prop_assert_eq!(applied.next_turn, game.current_turn.opponent());
                moves.push(Move::new(&game.id, &player, applied.move_number, &applied.san, &applied.fen, applied.captured.clone()));
                game.apply_patch(&applied.patch());
            }

            prop_assert_eq!(service.replay(&moves).unwrap(), game.fen);
        }
    }
}
