fn main() {
    if let Err(err) = enode_telemetry_api::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
