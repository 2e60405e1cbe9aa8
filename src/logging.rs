use std::fs::File;
use std::path::Path;

use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode, WriteLogger};

/// Initializes terminal + file logging for embedders that do not bring
/// their own logger. Info and above on the terminal, Debug and above in
/// the log file. Safe to call once per process; a second call is a no-op
/// because the global logger is already set.
pub fn init(log_path: &Path) {
    let mut sinks: Vec<Box<dyn simplelog::SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    if let Ok(file) = File::create(log_path) {
        sinks.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file));
    }

    let _ = CombinedLogger::init(sinks);
}
