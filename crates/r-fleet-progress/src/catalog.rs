//! ---
//! fleet_section: "05-observability"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch progress tracking."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use strum::{EnumIter, IntoEnumIterator};
use tracing::debug;

use crate::tick::{TickError, TickMatch, TickPattern, TickSpec};
use crate::{METER_UNKNOWN_ERROR, TICK_PREFIX};

const EMBEDDED_INSTALL_TICKS: &str = include_str!("../resources/install_ticks.json");

/// Output lines emitted by the launch pipeline and its install script.
pub mod lines {
    pub const CONFIRMING_NETWORK_LOCK: &str = "FLEET: CONFIRMING NETWORK LOCK...";
    pub const VALIDATING_NODE_NETWORK_AND_PLAN: &str = "FLEET: VALIDATING NODE, NETWORK, AND PLAN...";
    pub const CREATING_NODE: &str = "FLEET: CREATING NODE...";
    pub const LAUNCHING_NODE: &str = "FLEET: LAUNCHING NODE...";
    pub const PREPARING_ROLES: &str = "FLEET: PREPARING ROLES...";
    pub const PREPARING_INSTALL: &str = "FLEET: PREPARING INSTALL FILES...";
    pub const STARTING_INSTALL: &str = "FLEET: STARTING INSTALLATION...";
    pub const COPYING_INSTALL_FILES: &str = "FLEET: COPYING INSTALL FILES...";
    pub const RUNNING_INSTALLER: &str = "FLEET: RUNNING INSTALLER...";

    /// Line marking the `n`th heartbeat of the DNS wait.
    pub fn await_line(n: u32) -> String {
        format!("AWAIT-{}", n * 5 + 1)
    }
}

/// DNS wait milestones: `AWAIT-1`, `AWAIT-6`, ... `AWAIT-86`.
const AWAIT_PERCENTS: [u8; 18] = [8, 9, 10, 12, 13, 15, 16, 18, 19, 21, 22, 24, 25, 27, 28, 30, 31, 32];

fn standard_ticks() -> Vec<TickPattern> {
    let head = [
        ("confirming_network_lock", lines::CONFIRMING_NETWORK_LOCK, 1),
        (
            "validating_node_network_and_plan",
            lines::VALIDATING_NODE_NETWORK_AND_PLAN,
            1,
        ),
        ("creating_node", lines::CREATING_NODE, 1),
        ("launching_node", lines::LAUNCHING_NODE, 1),
        ("preparing_roles", lines::PREPARING_ROLES, 5),
        ("preparing_install", lines::PREPARING_INSTALL, 7),
    ];
    let tail = [
        ("starting_install", lines::STARTING_INSTALL, 34),
        ("copying_install_files", lines::COPYING_INSTALL_FILES, 35),
        ("running_installer", lines::RUNNING_INSTALLER, 37),
    ];

    let prefix = |(name, line, percent): (&str, &str, u8)| {
        TickPattern::literal(format!("{TICK_PREFIX}{name}"), line, TickMatch::Prefix, percent)
    };
    let awaits = AWAIT_PERCENTS.iter().enumerate().map(|(i, percent)| {
        TickPattern::literal(
            format!("{TICK_PREFIX}await_{}", i * 5 + 1),
            lines::await_line(i as u32),
            TickMatch::Exact,
            *percent,
        )
    });

    head.into_iter()
        .map(prefix)
        .chain(awaits)
        .chain(tail.into_iter().map(prefix))
        .collect()
}

/// Known fatal launch error lines and their message keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum ErrorLine {
    ConfirmingNetworkLock,
    NetworkNotReadyForSetup,
    NoCurrentNodeOrNetwork,
    PlanNotEnabled,
    PeerLimitReached,
    NodeCloudNotFound,
    StartingNode,
    SettingDnsEntries,
    NodeHasNoAddress,
    RoleValidationFailed,
    InstallFailed,
}

impl ErrorLine {
    pub fn line(self) -> &'static str {
        match self {
            ErrorLine::ConfirmingNetworkLock => "FLEET-ERROR: ERROR CONFIRMING NETWORK LOCK",
            ErrorLine::NetworkNotReadyForSetup => "FLEET-ERROR: NETWORK NOT READY FOR SETUP",
            ErrorLine::NoCurrentNodeOrNetwork => "FLEET-ERROR: NO CURRENT NODE OR NETWORK",
            ErrorLine::PlanNotEnabled => "FLEET-ERROR: PLAN NOT ENABLED",
            ErrorLine::PeerLimitReached => "FLEET-ERROR: PEER LIMIT REACHED",
            ErrorLine::NodeCloudNotFound => "FLEET-ERROR: NODE CLOUD NOT FOUND",
            ErrorLine::StartingNode => "FLEET-ERROR: ERROR STARTING NODE",
            ErrorLine::SettingDnsEntries => "FLEET-ERROR: ERROR SETTING DNS ENTRIES FOR NODE",
            ErrorLine::NodeHasNoAddress => "FLEET-ERROR: NODE STARTED BUT HAS NO IP ADDRESS",
            ErrorLine::RoleValidationFailed => "FLEET-ERROR: ROLE VALIDATION FAILED",
            ErrorLine::InstallFailed => "FLEET-ERROR: INSTALL FAILED",
        }
    }

    pub fn message_key(self) -> &'static str {
        match self {
            ErrorLine::ConfirmingNetworkLock => "meter_error_confirming_network_lock",
            ErrorLine::NetworkNotReadyForSetup => "meter_error_network_not_ready_for_setup",
            ErrorLine::NoCurrentNodeOrNetwork => "meter_error_no_current_node_or_network",
            ErrorLine::PlanNotEnabled => "meter_error_plan_not_enabled",
            ErrorLine::PeerLimitReached => "meter_error_peer_limit_reached",
            ErrorLine::NodeCloudNotFound => "meter_error_node_cloud_not_found",
            ErrorLine::StartingNode => "meter_error_starting_node",
            ErrorLine::SettingDnsEntries => "meter_error_dns",
            ErrorLine::NodeHasNoAddress => "meter_error_no_ip",
            ErrorLine::RoleValidationFailed => "meter_error_role_validation_errors",
            ErrorLine::InstallFailed => "meter_error_install_failed",
        }
    }
}

/// Message key for an error line, falling back to the unknown-error key.
pub fn error_message_key(line: &str) -> &'static str {
    let line = line.trim();
    ErrorLine::iter()
        .find(|candidate| candidate.line() == line)
        .map(ErrorLine::message_key)
        .unwrap_or(METER_UNKNOWN_ERROR)
}

/// Ordered tick list: the standard launch milestones followed by install ticks.
#[derive(Debug, Clone)]
pub struct TickCatalog {
    ticks: Vec<TickPattern>,
    standard_len: usize,
}

impl TickCatalog {
    /// Standard milestones only.
    pub fn standard() -> Self {
        let ticks = standard_ticks();
        let standard_len = ticks.len();
        Self {
            ticks,
            standard_len,
        }
    }

    /// Standard milestones followed by `install` rows, whose 0–100 percents
    /// are rescaled linearly into the range after the last standard tick.
    pub fn with_install_ticks(install: &[TickSpec]) -> Result<Self, TickError> {
        let mut catalog = Self::standard();
        let base = u32::from(catalog.last_standard().percent());
        for spec in install {
            let tick = TickPattern::from_spec(spec)?;
            let scaled = base + (u32::from(spec.percent) * (100 - base) + 50) / 100;
            let scaled = scaled.min(99) as u8;
            catalog.ticks.push(tick.with_percent(scaled));
        }
        debug!(
            standard = catalog.standard_len,
            install = install.len(),
            "tick catalog built"
        );
        Ok(catalog)
    }

    /// Standard milestones plus the install table shipped with the crate.
    pub fn embedded() -> Result<Self, TickError> {
        let specs: Vec<TickSpec> = serde_json::from_str(EMBEDDED_INSTALL_TICKS)?;
        Self::with_install_ticks(&specs)
    }

    /// Standard milestones plus an install table read from `path`.
    pub fn from_install_file(path: &Path) -> Result<Self, TickError> {
        let contents = fs::read_to_string(path)?;
        let specs: Vec<TickSpec> = serde_json::from_str(&contents)?;
        Self::with_install_ticks(&specs)
    }

    pub fn ticks(&self) -> &[TickPattern] {
        &self.ticks
    }

    /// Number of standard milestones; install ticks start at this index.
    pub fn standard_len(&self) -> usize {
        self.standard_len
    }

    pub fn last_standard(&self) -> &TickPattern {
        &self.ticks[self.standard_len - 1]
    }

    pub fn get(&self, index: usize) -> Option<&TickPattern> {
        self.ticks.get(index)
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_ticks_end_at_running_installer() {
        let catalog = TickCatalog::standard();
        assert_eq!(catalog.standard_len(), 6 + 18 + 3);
        let last = catalog.last_standard();
        assert_eq!(last.message_key(), "meter_tick_running_installer");
        assert_eq!(last.percent(), 37);
        assert!(catalog
            .ticks()
            .windows(2)
            .all(|pair| pair[0].percent() <= pair[1].percent()));
    }

    #[test]
    fn await_ticks_follow_heartbeat_lines() {
        let catalog = TickCatalog::standard();
        let first = catalog
            .ticks()
            .iter()
            .find(|tick| tick.matches(&lines::await_line(0)))
            .expect("await tick");
        assert_eq!(first.pattern(), "AWAIT-1");
        assert_eq!(first.percent(), 8);
        assert!(catalog
            .ticks()
            .iter()
            .any(|tick| tick.pattern() == "AWAIT-86" && tick.percent() == 32));
    }

    #[test]
    fn install_ticks_are_rescaled_after_standard_range() {
        let specs = vec![
            TickSpec {
                tick: "first".into(),
                pattern: "A".into(),
                match_type: TickMatch::Exact,
                percent: 0,
            },
            TickSpec {
                tick: "half".into(),
                pattern: "B".into(),
                match_type: TickMatch::Exact,
                percent: 50,
            },
            TickSpec {
                tick: "last".into(),
                pattern: "C".into(),
                match_type: TickMatch::Exact,
                percent: 100,
            },
        ];
        let catalog = TickCatalog::with_install_ticks(&specs).expect("catalog");
        let install: Vec<u8> = catalog.ticks()[catalog.standard_len()..]
            .iter()
            .map(TickPattern::percent)
            .collect();
        assert_eq!(install, vec![37, 69, 99]);
    }

    #[test]
    fn embedded_install_table_parses() {
        let catalog = TickCatalog::embedded().expect("embedded");
        assert!(catalog.len() > catalog.standard_len());
        assert!(catalog.ticks()[catalog.standard_len()..]
            .iter()
            .all(|tick| tick.percent() > 37 && tick.percent() < 100));
    }

    #[test]
    fn install_table_can_be_loaded_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ticks.json");
        fs::write(
            &path,
            r#"[{"tick":"custom","pattern":"CUSTOM STEP","match":"exact","percent":50}]"#,
        )
        .expect("write");
        let catalog = TickCatalog::from_install_file(&path).expect("catalog");
        let custom = catalog.get(catalog.standard_len()).expect("install tick");
        assert_eq!(custom.message_key(), "meter_tick_custom");
        assert_eq!(custom.match_type(), TickMatch::Exact);
        assert_eq!(custom.percent(), 69);
    }

    #[test]
    fn error_lines_map_to_keys_with_unknown_fallback() {
        assert_eq!(
            error_message_key(ErrorLine::PlanNotEnabled.line()),
            "meter_error_plan_not_enabled"
        );
        assert_eq!(
            error_message_key("  FLEET-ERROR: NODE STARTED BUT HAS NO IP ADDRESS\n"),
            "meter_error_no_ip"
        );
        assert_eq!(error_message_key("segfault"), METER_UNKNOWN_ERROR);
    }
}
