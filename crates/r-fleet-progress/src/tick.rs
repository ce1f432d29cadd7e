//! ---
//! fleet_section: "05-observability"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch progress tracking."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TICK_PREFIX;

#[derive(Debug, Error)]
pub enum TickError {
    #[error("invalid tick pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("tick {key} has percent {percent} outside 0..=100")]
    PercentOutOfRange { key: String, percent: u8 },
    #[error("failed to parse tick table: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read tick table: {0}")]
    Io(#[from] std::io::Error),
}

/// How a tick pattern is compared against an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMatch {
    /// Trimmed line equals the pattern.
    Exact,
    /// Trimmed line starts with the pattern.
    Prefix,
    /// The whole line matches the regular expression.
    #[default]
    Regex,
}

/// One row of a tick table as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSpec {
    pub tick: String,
    pub pattern: String,
    #[serde(default, rename = "match")]
    pub match_type: TickMatch,
    pub percent: u8,
}

/// A compiled tick: the pattern that marks a milestone and its percentage.
#[derive(Debug, Clone)]
pub struct TickPattern {
    message_key: String,
    pattern: String,
    match_type: TickMatch,
    percent: u8,
    regex: Option<Regex>,
}

impl TickPattern {
    pub fn new(
        message_key: impl Into<String>,
        pattern: impl Into<String>,
        match_type: TickMatch,
        percent: u8,
    ) -> Result<Self, TickError> {
        let message_key = message_key.into();
        let pattern = pattern.into();
        if percent > 100 {
            return Err(TickError::PercentOutOfRange {
                key: message_key,
                percent,
            });
        }
        let regex = match match_type {
            TickMatch::Regex => Some(Regex::new(&format!("^(?:{})$", pattern)).map_err(
                |source| TickError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                },
            )?),
            TickMatch::Exact | TickMatch::Prefix => None,
        };
        Ok(Self {
            message_key,
            pattern,
            match_type,
            percent,
            regex,
        })
    }

    /// Build an exact or prefix tick, which needs no compilation.
    pub(crate) fn literal(
        message_key: String,
        pattern: impl Into<String>,
        match_type: TickMatch,
        percent: u8,
    ) -> Self {
        debug_assert!(match_type != TickMatch::Regex && percent <= 100);
        Self {
            message_key,
            pattern: pattern.into(),
            match_type,
            percent,
            regex: None,
        }
    }

    /// Compile a table row, deriving the message key from its tick name.
    pub fn from_spec(spec: &TickSpec) -> Result<Self, TickError> {
        Self::new(
            format!("{}{}", TICK_PREFIX, spec.tick),
            spec.pattern.clone(),
            spec.match_type,
            spec.percent,
        )
    }

    pub fn matches(&self, line: &str) -> bool {
        match self.match_type {
            TickMatch::Exact => line.trim() == self.pattern,
            TickMatch::Prefix => line.trim().starts_with(&self.pattern),
            TickMatch::Regex => self
                .regex
                .as_ref()
                .is_some_and(|regex| regex.is_match(line)),
        }
    }

    pub fn message_key(&self) -> &str {
        &self.message_key
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn match_type(&self) -> TickMatch {
        self.match_type
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub(crate) fn with_percent(mut self, percent: u8) -> Self {
        self.percent = percent;
        self
    }
}

/// Published progress of one launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressTick {
    pub account: String,
    pub network: String,
    pub launch: String,
    pub message_key: String,
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default)]
    pub error: bool,
    pub timestamp: DateTime<Utc>,
}

impl ProgressTick {
    pub fn new(
        account: impl Into<String>,
        network: impl Into<String>,
        launch: impl Into<String>,
        message_key: impl Into<String>,
        percent: u8,
    ) -> Self {
        Self {
            account: account.into(),
            network: network.into(),
            launch: launch.into(),
            message_key: message_key.into(),
            percent,
            details: None,
            error: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn as_error(mut self) -> Self {
        self.error = true;
        self
    }

    /// Whether no further ticks will follow for this launch.
    pub fn is_terminal(&self) -> bool {
        self.error
            || self.message_key == crate::METER_COMPLETED
            || self.message_key == crate::METER_CANCELED
    }
}
