fn main() {
    let args: Vec<String> = std::env::args().collect();
    if let Err(err) = fieldscout::run(&args) {
        eprintln!("fieldscout: {}", err);
        std::process::exit(1);
    }
}
