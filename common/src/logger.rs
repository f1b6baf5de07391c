use redox_log::{OutputBuilder, RedoxLogger};

/// Configures logging for one subsystem.
///
/// The board has a single console, so the output takes the more verbose of
/// the two levels. Returns `false` when a logger is already installed.
pub fn setup_logging(
    category: &str,
    subcategory: &str,
    name: &str,
    output_level: log::LevelFilter,
    file_level: log::LevelFilter,
) -> bool {
    let logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level.max(file_level))
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    match logger.enable() {
        Ok(_) => {
            log::debug!("{}/{}: {} logging enabled", category, subcategory, name);
            true
        }
        Err(error) => {
            eprintln!("{}: failed to set default logger: {}", name, error);
            false
        }
    }
}
