fn main() {
    if let Err(err) = image_spider::run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
