fn main() {
    if let Err(err) = jarvis_host::cli::run_jarvis() {
        tracing::error!(error = %err, "jarvis failed");
        std::process::exit(1);
    }
}
