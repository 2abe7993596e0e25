fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    if let Err(e) = jamlink::run() {
        eprintln!("jamlink: {}", e);
        std::process::exit(1);
    }
}
