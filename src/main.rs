fn main() {
    if let Err(e) = wand_sigil_lib::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
