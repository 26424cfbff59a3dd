//! Logging utilities with colored module prefixes.
//!
//! Provides the `log!` macro for formatted terminal output:
//!
//! ```ignore
//! log!("serve"; "http://{}", addr);
//! log!("sync"; "pushed {} documents", count);
//! ```

use colored::{Color, Colorize};

/// Palette for module prefixes, picked by a stable hash of the module name
/// so a given module always logs in the same color.
const PALETTE: &[Color] = &[
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Magenta,
    Color::Blue,
];

fn module_color(module: &str) -> Color {
    let hash: usize = module.bytes().map(usize::from).sum();
    PALETTE[hash % PALETTE.len()]
}

/// Write a log line with a colored `[module]` prefix to stderr.
pub fn log(module: &str, msg: &str) {
    let prefix = format!("[{module}]").color(module_color(module)).bold();
    eprintln!("{prefix} {msg}");
}

/// Log a message with a colored module prefix.
///
/// # Usage
/// ```ignore
/// log!("module"; "message with {} formatting", args);
/// ```
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_color_stable() {
        assert_eq!(module_color("serve"), module_color("serve"));
        assert_eq!(module_color("watch"), module_color("watch"));
    }

    #[test]
    fn test_log_macro_expands() {
        log!("test"; "value {} and {}", 1, "two");
    }
}
