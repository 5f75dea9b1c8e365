// Output formatting helpers for CLI commands

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Intermediate payload line (indented)
pub fn payload(step: &str, label: &str, bytes: usize) {
    println!("        | {} {} ({} bytes)", step, label, bytes);
}

/// Progress as a fixed-width bar, e.g. `[#####-----]  50%`
pub fn progress_bar(progress: f64) -> String {
    const WIDTH: usize = 20;
    let progress = progress.clamp(0.0, 1.0);
    let filled = (progress * WIDTH as f64).round() as usize;
    format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        "-".repeat(WIDTH - filled),
        (progress * 100.0).round() as u32
    )
}
