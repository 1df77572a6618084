//! Console log format shared with the other reDB services.

use std::fmt;
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const NAME_COLUMN: usize = 20;
const LEVEL_COLUMN: usize = 9;

/// Log at info with a `component` field
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log at warn with a `component` field
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// ANSI escapes, or empty strings when color is off
#[derive(Debug, Clone, Copy)]
struct Palette {
    reset: &'static str,
    stamp: &'static str,
    error: &'static str,
    warn: &'static str,
    info: &'static str,
    quiet: &'static str,
}

impl Palette {
    const ANSI: Palette = Palette {
        reset: "\x1b[0m",
        stamp: "\x1b[36m",
        error: "\x1b[91m",
        warn: "\x1b[93m",
        info: "\x1b[32m",
        quiet: "\x1b[90m",
    };

    const PLAIN: Palette = Palette {
        reset: "",
        stamp: "",
        error: "",
        warn: "",
        info: "",
        quiet: "",
    };

    /// Label and color for `level`
    fn level(&self, level: &Level) -> (&'static str, &'static str) {
        match *level {
            Level::ERROR => ("✗ ERROR", self.error),
            Level::WARN => ("⚠ WARN", self.warn),
            Level::INFO => ("ℹ INFO", self.info),
            Level::DEBUG => ("◦ DEBUG", self.quiet),
            Level::TRACE => ("◦ TRACE", self.quiet),
        }
    }
}

/// `[timestamp] [service-component] [level] message key=value...`
pub struct MuxLogFormatter {
    service_name: String,
    palette: Palette,
}

impl MuxLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        let palette = if color_supported() {
            Palette::ANSI
        } else {
            Palette::PLAIN
        };
        Self {
            service_name: service_name.into(),
            palette,
        }
    }

    /// Fixed-width name column; long names end in an ellipsis
    fn name_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };
        if name.chars().count() <= NAME_COLUMN {
            return format!("{:<NAME_COLUMN$}", name);
        }
        let mut cut: String = name.chars().take(NAME_COLUMN - 1).collect();
        cut.push('…');
        cut
    }
}

impl<S, N> FormatEvent<S, N> for MuxLogFormatter
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
        let mut fields = EventFields::default();
        event.record(&mut fields);

        let p = self.palette;
        let (label, color) = p.level(event.metadata().level());
        write!(
            writer,
            "{}[{}] [{}] [{}{:<LEVEL_COLUMN$}{}] {}",
            p.stamp,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.name_column(fields.component.as_deref()),
            color,
            label,
            p.reset,
            fields.message
        )?;
        for (name, value) in &fields.extra {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer, "{}", p.reset)
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl EventFields {
    fn put(&mut self, name: &'static str, value: String) {
        match name {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            _ => self.extra.push((name, value)),
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let value = match rendered.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            Some(inner) => inner.to_string(),
            None => rendered,
        };
        self.put(field.name(), value);
    }
}

fn color_supported() -> bool {
    std::env::var("TERM").map_or(true, |term| term != "dumb") && std::io::stderr().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> MuxLogFormatter {
        MuxLogFormatter {
            service_name: "mux".to_string(),
            palette: Palette::PLAIN,
        }
    }

    #[test]
    fn test_name_column_padding() {
        let formatter = plain();
        assert_eq!(formatter.name_column(None).len(), NAME_COLUMN);
        assert!(formatter.name_column(Some("echo")).starts_with("mux-echo "));
    }

    #[test]
    fn test_long_component_is_truncated() {
        let name = plain().name_column(Some("a-very-long-component-name"));
        assert_eq!(name.chars().count(), NAME_COLUMN);
        assert!(name.ends_with('…'));
    }

    #[test]
    fn test_plain_palette_has_no_escapes() {
        let (label, color) = Palette::PLAIN.level(&Level::WARN);
        assert_eq!(label, "⚠ WARN");
        assert_eq!(color, "");
    }
}
