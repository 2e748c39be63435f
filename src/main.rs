#[tokio::main]
async fn main() {
    if let Err(e) = game_ratings::start_server().await {
        eprintln!("rating service failed: {e}");
        std::process::exit(1);
    }
}
