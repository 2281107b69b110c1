fn main() {
    if let Err(error) = market_feed::run() {
        eprintln!("market-feed failed: {error}");
        std::process::exit(1);
    }
}
