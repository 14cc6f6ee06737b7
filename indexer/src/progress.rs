use indicatif::{ProgressBar, ProgressStyle};

fn style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {prefix:<12} [{bar:40.cyan/dim}] {pos}/{len} eta {eta} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╸")
}

/// A bar over `len` items, or a hidden one when output is not wanted.
pub fn bar(len: u64, prefix: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    pb.set_style(style());
    pb.set_prefix(prefix.to_string());
    pb
}
