// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parser for the `key=value,key=value` settings string.
//!
//! The parser runs once during initialisation, so it is free to allocate. It never fails: a value
//! that cannot be understood produces a [`SettingWarning`] and the previous value of the setting
//! is kept.

use super::{
    BacktraceSettings, ImagesToShow, OnOffTty, OutputFormat, OutputTo, Preset, RegistersToShow,
    SanitizePaths, Symbolication, ThreadsToShow, UnwindAlgorithm,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingWarning {
    #[error("unknown backtracing setting '{key}'")]
    UnknownSetting { key: String },
    #[error("bad value '{value}' for backtracing setting '{key}'")]
    BadValue { key: &'static str, value: String },
    #[error("bad backtracing timeout {seconds}s, using 0")]
    NegativeTimeout { seconds: i64 },
}

/// Parses settings strings into a [`BacktraceSettings`].
///
/// Keys may carry a namespace prefix. When a prefix is configured, unknown keys that carry it are
/// reported (they are most likely misspellings of one of our keys), while unknown keys without it
/// are skipped silently because the variable may be shared with other components. With the
/// default empty prefix every key is in our namespace.
#[derive(Debug, Clone, Default)]
pub struct SettingsParser {
    namespace: String,
}

impl SettingsParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Applies every `key=value` pair in `settings` to `target`, in order, so the last occurrence
    /// of a key wins. Segments without an `=` are ignored.
    pub fn parse(&self, settings: &str, target: &mut BacktraceSettings) -> Vec<SettingWarning> {
        let mut warnings = vec![];
        for segment in settings.split(',') {
            let Some((key, value)) = segment.split_once('=') else {
                continue;
            };
            let (key, in_namespace) = self.strip_namespace(key);
            if let Err(warning) = apply(key, value, target) {
                match warning {
                    SettingWarning::UnknownSetting { .. } if !in_namespace => (),
                    warning => warnings.push(warning),
                }
            }
        }
        warnings
    }

    fn strip_namespace<'a>(&self, key: &'a str) -> (&'a str, bool) {
        if self.namespace.is_empty() {
            return (key, true);
        }
        match key.get(..self.namespace.len()) {
            Some(head) if head.eq_ignore_ascii_case(&self.namespace) => {
                (&key[self.namespace.len()..], true)
            }
            _ => (key, false),
        }
    }
}

fn apply(key: &str, value: &str, target: &mut BacktraceSettings) -> Result<(), SettingWarning> {
    let is = |name: &str| key.eq_ignore_ascii_case(name);
    if is("enable") {
        target.enabled = parse_on_off_tty(value);
    } else if is("demangle") {
        target.demangle = parse_boolean(value);
    } else if is("interactive") {
        target.interactive = parse_on_off_tty(value);
    } else if is("color") {
        target.color = parse_on_off_tty(value);
    } else if is("timeout") {
        target.timeout = match parse_timeout(value) {
            Ok(seconds) => seconds,
            Err(warning @ SettingWarning::NegativeTimeout { .. }) => {
                target.timeout = 0;
                return Err(warning);
            }
            Err(warning) => return Err(warning),
        };
    } else if is("unwind") {
        target.algorithm = match_keyword(
            "unwind",
            value,
            &[
                ("auto", UnwindAlgorithm::Auto),
                ("fast", UnwindAlgorithm::Fast),
                ("precise", UnwindAlgorithm::Precise),
            ],
        )?;
    } else if is("sanitize") {
        target.sanitize = if parse_boolean(value) {
            SanitizePaths::On
        } else {
            SanitizePaths::Off
        };
    } else if is("preset") {
        target.preset = match_keyword(
            "preset",
            value,
            &[
                ("auto", Preset::Auto),
                ("friendly", Preset::Friendly),
                ("medium", Preset::Medium),
                ("full", Preset::Full),
            ],
        )?;
    } else if is("threads") {
        target.threads = match_keyword(
            "threads",
            value,
            &[
                ("all", ThreadsToShow::All),
                ("crashed", ThreadsToShow::Crashed),
            ],
        )?;
    } else if is("registers") {
        target.registers = match_keyword(
            "registers",
            value,
            &[
                ("none", RegistersToShow::None),
                ("all", RegistersToShow::All),
                ("crashed", RegistersToShow::Crashed),
            ],
        )?;
    } else if is("images") {
        target.images = match_keyword(
            "images",
            value,
            &[
                ("none", ImagesToShow::None),
                ("all", ImagesToShow::All),
                ("mentioned", ImagesToShow::Mentioned),
            ],
        )?;
    } else if is("limit") {
        target.limit = if value.eq_ignore_ascii_case("none") {
            -1
        } else {
            match value.parse::<i32>() {
                Ok(limit) if limit > 0 => limit,
                _ => return Err(bad_value("limit", value)),
            }
        };
    } else if is("top") {
        target.top = value.parse::<u32>().map_err(|_| bad_value("top", value))?;
    } else if is("cache") {
        target.cache = parse_boolean(value);
    } else if is("output-to") {
        if value.eq_ignore_ascii_case("auto") {
            target.output_to = OutputTo::Auto;
        } else if value.eq_ignore_ascii_case("stdout") {
            target.output_to = OutputTo::Stdout;
        } else if value.eq_ignore_ascii_case("stderr") {
            target.output_to = OutputTo::Stderr;
        } else {
            target.output_to = OutputTo::File;
            target.output_path = Some(value.to_string());
        }
    } else if is("symbolicate") {
        target.symbolicate = parse_symbolication(value);
    } else if is("format") {
        target.format = match_keyword(
            "format",
            value,
            &[("text", OutputFormat::Text), ("json", OutputFormat::Json)],
        )?;
    } else if is("backtracer") {
        target.backtracer_path = Some(value.to_string());
    } else if is("warnings") {
        target.suppress_warnings = match_keyword(
            "warnings",
            value,
            &[
                ("suppressed", true),
                ("disabled", true),
                ("off", true),
                ("enabled", false),
                ("on", false),
            ],
        )?;
    } else {
        return Err(SettingWarning::UnknownSetting {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn bad_value(key: &'static str, value: &str) -> SettingWarning {
    SettingWarning::BadValue {
        key,
        value: value.to_string(),
    }
}

fn match_keyword<T: Copy>(
    key: &'static str,
    value: &str,
    table: &[(&str, T)],
) -> Result<T, SettingWarning> {
    table
        .iter()
        .find(|(name, _)| value.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
        .ok_or_else(|| bad_value(key, value))
}

fn is_affirmative(value: &str) -> bool {
    ["on", "true", "yes", "y", "t", "1"]
        .iter()
        .any(|v| value.eq_ignore_ascii_case(v))
}

pub(crate) fn parse_boolean(value: &str) -> bool {
    is_affirmative(value)
}

pub(crate) fn parse_on_off_tty(value: &str) -> OnOffTty {
    if is_affirmative(value) {
        OnOffTty::On
    } else if value.eq_ignore_ascii_case("tty") || value.eq_ignore_ascii_case("auto") {
        OnOffTty::Tty
    } else {
        OnOffTty::Off
    }
}

pub(crate) fn parse_symbolication(value: &str) -> Symbolication {
    if is_affirmative(value) || value.eq_ignore_ascii_case("full") {
        Symbolication::Full
    } else if value.eq_ignore_ascii_case("fast") {
        Symbolication::Fast
    } else {
        Symbolication::Off
    }
}

/// `none`, or an integer followed by an optional unit.
fn parse_timeout(value: &str) -> Result<u32, SettingWarning> {
    if value.eq_ignore_ascii_case("none") {
        return Ok(0);
    }
    let trimmed = value.trim_start();
    let digits_start = usize::from(trimmed.starts_with(['-', '+']));
    let digits_end = trimmed[digits_start..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(trimmed.len(), |i| i + digits_start);
    let count: i64 = trimmed[..digits_end]
        .parse()
        .map_err(|_| bad_value("timeout", value))?;

    let unit = trimmed[digits_end..].trim();
    let multiplier = if unit.is_empty()
        || unit.eq_ignore_ascii_case("s")
        || unit.eq_ignore_ascii_case("seconds")
    {
        1
    } else if unit.eq_ignore_ascii_case("m") || unit.eq_ignore_ascii_case("minutes") {
        60
    } else if unit.eq_ignore_ascii_case("h") || unit.eq_ignore_ascii_case("hours") {
        3600
    } else {
        return Err(bad_value("timeout", value));
    };

    let seconds = count
        .checked_mul(multiplier)
        .ok_or_else(|| bad_value("timeout", value))?;
    if seconds < 0 {
        return Err(SettingWarning::NegativeTimeout { seconds });
    }
    u32::try_from(seconds).map_err(|_| bad_value("timeout", value))
}
