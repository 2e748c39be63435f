pub mod rating;

pub use rating::{GameAggregate, Rating, RatingMessage, SubmitOutcome, UserRating};
