use colored::Colorize;

/// Initializes env_logger with an `info` default so a bare deployment still
/// shows pool decisions. `RUST_LOG` overrides as usual.
pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

pub fn print_banner(title: &str, color: fn(&str) -> colored::ColoredString) {
    let border = "╔═══════════════════════════════════════════════════════════════╗";
    let bottom = "╚═══════════════════════════════════════════════════════════════╝";

    println!("{}", color(border));
    println!("{}", color(&format!("║{:^63}║", title)));
    println!("{}", color(bottom));
}
