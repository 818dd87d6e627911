fn main() {
    if let Err(error) = splatmesh_cli::run_cli() {
        // Configuration, input, density and IO failures all map to a
        // single failure exit code; the message carries the detail.
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}
