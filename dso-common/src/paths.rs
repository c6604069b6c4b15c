//! Version- and variant-aware remote path resolution.
//!
//! Resolution is table-driven: each logical name has a list of rules ordered
//! by the first major version they apply to. The last rule whose threshold is
//! at or below the device version wins, so versions newer than the table use
//! the newest rule. Every rule path is relative to the variant's namespace
//! root.

use std::collections::BTreeMap;

use crate::types::{LogicalName, PathSet, SoftwareVersion, Variant};

/// Namespace root for the privileged-home layout.
pub const LEGACY_ROOT: &str = "/private/var";
/// Namespace root for the prefix-relocated layout.
pub const RELOCATED_ROOT: &str = "/var/jb/var";

/// One row of the resolution table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathRule {
    pub name: LogicalName,
    /// First major version the rule applies to.
    pub since_major: u32,
    /// Path relative to the variant root.
    pub relative: &'static str,
    /// Directory tree (relative) owning the file; normalised after writes.
    pub owner_tree: &'static str,
    pub effect: &'static str,
}

/// Resolution table. Rules for a name must be sorted by `since_major`.
pub const PATH_RULES: &[PathRule] = &[
    PathRule {
        name: LogicalName::ActivationRecord,
        since_major: 0,
        relative: "root/Library/Lockdown/activation_records/activation_record.plist",
        owner_tree: "root/Library/Lockdown",
        effect: "activation record lives in the privileged home lockdown directory",
    },
    PathRule {
        name: LogicalName::ActivationRecord,
        since_major: 15,
        relative: "containers/Data/System/com.apple.mobileactivationd/Library/internal/activation_records/activation_record.plist",
        owner_tree: "containers/Data/System/com.apple.mobileactivationd/Library/internal",
        effect: "versions >= 15 relocate the activation record under the per-process data namespace",
    },
    PathRule {
        name: LogicalName::DataArk,
        since_major: 0,
        relative: "root/Library/Lockdown/data_ark.plist",
        owner_tree: "root/Library/Lockdown",
        effect: "data ark lives next to the lockdown state",
    },
    PathRule {
        name: LogicalName::SetupPrefs,
        since_major: 0,
        relative: "mobile/Library/Preferences/com.apple.purplebuddy.plist",
        owner_tree: "mobile/Library/Preferences",
        effect: "setup-completion marker lives in the user preferences domain",
    },
    PathRule {
        name: LogicalName::SetupPrefs,
        since_major: 14,
        relative: "containers/Shared/SystemGroup/systemgroup.com.apple.configurationprofiles/Library/ConfigurationProfiles/com.apple.purplebuddy.plist",
        owner_tree: "containers/Shared/SystemGroup/systemgroup.com.apple.configurationprofiles/Library/ConfigurationProfiles",
        effect: "versions >= 14 relocate the setup-completion marker under the shared configuration-profile namespace",
    },
];

/// One row of the decommission catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecommissionRule {
    pub name: LogicalName,
    /// First major version the entry is removed on.
    pub since_major: u32,
    pub effect: &'static str,
}

/// Entries a decommission deletes. The data ark is absent on purpose: the
/// install flow only ever overwrites it, and the device cannot rebuild it.
pub const DECOMMISSION_RULES: &[DecommissionRule] = &[
    DecommissionRule {
        name: LogicalName::ActivationRecord,
        since_major: 0,
        effect: "removing the activation record returns the device to unactivated",
    },
    DecommissionRule {
        name: LogicalName::SetupPrefs,
        since_major: 0,
        effect: "removing the setup-completion marker re-runs setup on next boot",
    },
];

/// Marker paths and identity signatures diagnostic of one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerCatalogue {
    pub variant: Variant,
    /// Probed in order; the first that exists decides.
    pub markers: &'static [&'static str],
    /// Case-insensitive substrings of the system identification string.
    pub signatures: &'static [&'static str],
}

/// Relocated layout markers. Checked before the legacy catalogue because a
/// relocated device may still carry stale legacy paths.
pub const RELOCATED_MARKERS: MarkerCatalogue = MarkerCatalogue {
    variant: Variant::Relocated,
    markers: &[
        "/var/jb",
        "/var/jb/usr/bin/bash",
        "/var/jb/Applications/Sileo.app",
        "/var/jb/.installed_dopamine",
    ],
    signatures: &["dopamine", "palera1n", "rootless"],
};

pub const LEGACY_MARKERS: MarkerCatalogue = MarkerCatalogue {
    variant: Variant::Legacy,
    markers: &[
        "/Applications/Cydia.app",
        "/bin/bash",
        "/etc/apt",
        "/Library/MobileSubstrate",
    ],
    signatures: &["checkra1n", "unc0ver", "taurine", "odyssey"],
};

pub const MARKER_CATALOGUES: [MarkerCatalogue; 2] = [RELOCATED_MARKERS, LEGACY_MARKERS];

/// Pure mapping from (version, variant) to a [`PathSet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionPathResolver;

impl VersionPathResolver {
    pub fn new() -> Self {
        Self
    }

    /// Namespace root for a variant.
    pub const fn root(variant: Variant) -> &'static str {
        match variant {
            Variant::Legacy => LEGACY_ROOT,
            Variant::Relocated => RELOCATED_ROOT,
        }
    }

    /// The rule that applies to `name` at `version`.
    pub fn rule_for(&self, name: LogicalName, version: SoftwareVersion) -> Option<&'static PathRule> {
        PATH_RULES
            .iter()
            .rev()
            .find(|rule| rule.name == name && rule.since_major <= version.major)
    }

    /// Resolve every logical name. Total for all inputs.
    pub fn resolve(&self, version: SoftwareVersion, variant: Variant) -> PathSet {
        let root = Self::root(variant);
        let mut entries = BTreeMap::new();
        let mut permission_roots: Vec<String> = Vec::new();

        for name in LogicalName::ALL {
            let Some(rule) = self.rule_for(name, version) else {
                continue;
            };
            entries.insert(name, join(root, rule.relative));
            let tree = join(root, rule.owner_tree);
            if !permission_roots.contains(&tree) {
                permission_roots.push(tree);
            }
        }

        PathSet {
            variant,
            version,
            entries,
            permission_roots,
            canonical_marker: LogicalName::ActivationRecord,
        }
    }

    /// Paths a decommission deletes, resolved against `paths`, in
    /// catalogue order.
    pub fn decommission_targets(&self, paths: &PathSet) -> Vec<(LogicalName, String)> {
        DECOMMISSION_RULES
            .iter()
            .filter(|rule| rule.since_major <= paths.version.major)
            .filter_map(|rule| paths.path(rule.name).map(|p| (rule.name, p.to_string())))
            .collect()
    }
}

fn join(root: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

/// Parent directory of an absolute remote path, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return Some("/");
    }
    Some(&trimmed[..idx])
}
