use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::PolicydError;

/// `<ubuntu series>_<openstack codename>` pairs in release order.
const RELEASE_PAIRS: &[&str] = &[
    "trusty_icehouse",
    "trusty_kilo",
    "trusty_liberty",
    "trusty_mitaka",
    "xenial_mitaka",
    "xenial_newton",
    "yakkety_newton",
    "xenial_ocata",
    "zesty_ocata",
    "xenial_pike",
    "artful_pike",
    "xenial_queens",
    "bionic_queens",
    "bionic_rocky",
    "cosmic_rocky",
    "bionic_stein",
    "disco_stein",
    "bionic_train",
    "eoan_train",
    "bionic_ussuri",
    "focal_ussuri",
    "focal_victoria",
    "groovy_victoria",
    "focal_wallaby",
    "hirsute_wallaby",
    "focal_xena",
    "impish_xena",
    "focal_yoga",
    "jammy_yoga",
    "jammy_zed",
    "kinetic_zed",
    "jammy_antelope",
    "lunar_antelope",
    "jammy_bobcat",
    "mantic_bobcat",
    "jammy_caracal",
    "noble_caracal",
];

/// First release whose charms support policy overrides.
pub const MINIMUM_RELEASE: &str = "xenial_queens";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenStackRelease {
    index: usize,
}

impl OpenStackRelease {
    pub fn name(&self) -> &'static str {
        RELEASE_PAIRS[self.index]
    }

    pub fn minimum() -> Self {
        Self {
            index: RELEASE_PAIRS
                .iter()
                .position(|pair| *pair == MINIMUM_RELEASE)
                .unwrap_or(0),
        }
    }

    pub fn supports_policy_overrides(&self) -> bool {
        *self >= Self::minimum()
    }
}

impl FromStr for OpenStackRelease {
    type Err = PolicydError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        RELEASE_PAIRS
            .iter()
            .position(|pair| *pair == normalized)
            .map(|index| Self { index })
            .ok_or_else(|| PolicydError::Config(format!("unknown openstack release '{}'", raw)))
    }
}

impl PartialOrd for OpenStackRelease {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenStackRelease {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl Display for OpenStackRelease {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
