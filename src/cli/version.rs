/// Display version information
pub fn execute() {
    println!("xare {}", env!("CARGO_PKG_VERSION"));
    println!("Single-peer OMEMO bot for XMPP");
}
