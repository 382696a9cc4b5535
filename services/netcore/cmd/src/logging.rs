use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths for alignment
const SERVICE_NAME_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Line formatter: `[timestamp] [service] [level] message key=value...`
pub struct NetcoreLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log under a named component, shown as `<service>-<component>`
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl NetcoreLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: color_supported(),
        }
    }

    /// Force colors on or off
    pub fn with_color(mut self, enabled: bool) -> Self {
        self.color_enabled = enabled;
        self
    }

    fn format_service_name(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        // +2 for the icon
        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn get_color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn format_line(&self, timestamp: &str, level: &tracing::Level, fields: &FieldVisitor) -> String {
        let color = self.get_color_for_level(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        let mut line = format!(
            "{}[{}] [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            self.format_service_name(fields.component.as_deref()),
            color,
            self.format_log_level(level),
            reset,
            fields.message
        );
        for (key, value) in &fields.extra {
            let _ = write!(line, " {}={}", key, value);
        }
        line.push_str(reset);
        line
    }
}

impl<S, N> FormatEvent<S, N> for NetcoreLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        writeln!(writer, "{}", self.format_line(&timestamp, event.metadata().level(), &visitor))
    }
}

/// Splits an event into message, component and remaining fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl FieldVisitor {
    fn record_value(&mut self, field: &tracing::field::Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            name => self.extra.push((name, value)),
        }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let mut text = format!("{:?}", value);
        if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
            text = text[1..text.len() - 1].to_string();
        }
        self.record_value(field, text);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.record_value(field, value.to_string());
    }
}

/// Colors only on an interactive, non-dumb terminal
fn color_supported() -> bool {
    if std::env::var("TERM").map(|term| term == "dumb").unwrap_or(true) {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_padding_and_truncation() {
        let formatter = NetcoreLogFormatter::new("netcore").with_color(false);
        let padded = formatter.format_service_name(None);
        assert_eq!(padded.len(), SERVICE_NAME_WIDTH);
        assert!(padded.starts_with("netcore "));

        assert_eq!(
            formatter.format_service_name(Some("sweep")).trim_end(),
            "netcore-sweep"
        );

        let long = formatter.format_service_name(Some("a-very-long-component"));
        assert_eq!(long.chars().count(), SERVICE_NAME_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_line_without_color() {
        let formatter = NetcoreLogFormatter::new("netcore").with_color(false);
        let fields = FieldVisitor {
            message: "Listener started".to_string(),
            component: Some("tcp".to_string()),
            extra: vec![("port", "7000".to_string())],
        };

        let line = formatter.format_line("2024-01-01 00:00:00.000", &tracing::Level::INFO, &fields);
        assert!(line.starts_with("[2024-01-01 00:00:00.000] [netcore-tcp"));
        assert!(line.contains("[ℹ INFO"));
        assert!(line.ends_with("Listener started port=7000"));
        assert!(!line.contains('\x1b'));
    }

    #[test]
    fn test_line_with_color() {
        let formatter = NetcoreLogFormatter::new("netcore").with_color(true);
        let fields = FieldVisitor {
            message: "boom".to_string(),
            ..FieldVisitor::default()
        };

        let line = formatter.format_line("t", &tracing::Level::ERROR, &fields);
        assert!(line.starts_with(COLOR_CYAN));
        assert!(line.contains(COLOR_BRIGHT_RED));
        assert!(line.ends_with(COLOR_RESET));
    }
}
