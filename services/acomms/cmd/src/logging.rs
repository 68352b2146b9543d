//! Log line formatting for the node binary.
//!
//! Lines look like `[2024-05-01 12:00:00.000] [acomms-mac   ] [INFO ] message`.

use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[90m";
const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[93m";
const RED: &str = "\x1b[91m";

const COMPONENT_WIDTH: usize = 14;

/// Log an info line tagged with a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log a warning tagged with a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log a debug line tagged with a component
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Log an error tagged with a component
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// `[timestamp] [component] [level] message` formatter
pub struct AcommsLogFormatter {
    default_component: String,
    color: bool,
}

impl AcommsLogFormatter {
    /// Formatter labelling untagged events with `default_component`
    pub fn new(default_component: impl Into<String>) -> Self {
        Self {
            default_component: default_component.into(),
            color: std::io::stderr().is_terminal() && std::env::var("TERM").map_or(false, |t| t != "dumb"),
        }
    }

    fn component_label(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("acomms-{}", component),
            None => self.default_component.clone(),
        };
        let name: String = name.chars().take(COMPONENT_WIDTH).collect();
        format!("{:<width$}", name, width = COMPONENT_WIDTH)
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.color {
            return "";
        }
        match *level {
            Level::ERROR => RED,
            Level::WARN => YELLOW,
            Level::INFO => GREEN,
            Level::DEBUG | Level::TRACE => DIM,
        }
    }
}

impl<S, N> FormatEvent<S, N> for AcommsLogFormatter
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
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        let (cyan, color, reset) = if self.color {
            (CYAN, self.level_color(level), RESET)
        } else {
            ("", "", "")
        };

        writeln!(
            writer,
            "{}[{}]{} [{}] [{}{:<5}{}] {}",
            cyan,
            timestamp,
            reset,
            self.component_label(fields.component.as_deref()),
            color,
            level.as_str(),
            reset,
            fields.message
        )
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
}

impl tracing::field::Visit for EventFields {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => self.component = Some(format!("{:?}", value).trim_matches('"').to_string()),
            _ => {}
        }
    }
}
