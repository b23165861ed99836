fn main() -> Result<(), Box<dyn std::error::Error>> {
    muxchat::cli::main()
}
