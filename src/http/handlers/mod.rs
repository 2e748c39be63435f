pub mod rating;

pub use rating::{
    get_game_rating_handler, get_top_games_handler, health_handler, submit_rating_handler,
};
