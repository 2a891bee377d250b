use colored::*;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{
        format::{self, Writer},
        FmtContext, FormatEvent,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::Verbosity;

/// Prints events the way the scan banner does: `[*]` progress in cyan,
/// `[!]` problems in yellow or red, debug detail unmarked.
pub struct ConsoleFormatter;

fn paint(level: Level, line: String) -> ColoredString {
    match level {
        Level::ERROR => format!("[!] {line}").red().bold(),
        Level::WARN => format!("[!] {line}").yellow(),
        Level::INFO => format!("[*] {line}").cyan(),
        Level::DEBUG => line.yellow(),
        Level::TRACE => line.dimmed(),
    }
}

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> format::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut line = String::new();
        ctx.field_format()
            .format_fields(Writer::new(&mut line), event)?;

        writeln!(writer, "{}", paint(*event.metadata().level(), line))
    }
}

/// `LOG` overrides the level picked from `verbosity`.
pub fn init(verbosity: Verbosity) {
    let fallback = if verbosity.is_debug() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("LOG").unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().event_format(ConsoleFormatter))
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_follow_severity() {
        colored::control::set_override(false);

        assert_eq!(paint(Level::INFO, "Running nmap...".into()).to_string(), "[*] Running nmap...");
        assert_eq!(paint(Level::WARN, "x".into()).to_string(), "[!] x");
        assert_eq!(paint(Level::ERROR, "x".into()).to_string(), "[!] x");
        assert_eq!(paint(Level::DEBUG, "    Return code: 0".into()).to_string(), "    Return code: 0");
    }
}
