fn main() {
    if let Err(err) = brushtales_lib::run() {
        eprintln!("brushtales: {err:#}");
        std::process::exit(1);
    }
}
