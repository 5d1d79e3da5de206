use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{Record, StateEntry};

/// Decides which differences between a record and the stored state count
/// as a change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// Only `available_spaces` is compared.
    #[default]
    AvailableSpaces,
    /// A flip of the `closed` flag is also a change.
    AvailableSpacesOrClosed,
}

impl ChangePolicy {
    /// A facility with no prior state is always a change.
    pub fn is_change(&self, prior: Option<&StateEntry>, record: &Record) -> bool {
        let Some(prior) = prior else {
            return true;
        };

        match self {
            ChangePolicy::AvailableSpaces => prior.available_spaces != record.available_spaces,
            ChangePolicy::AvailableSpacesOrClosed => {
                prior.available_spaces != record.available_spaces || prior.closed != record.closed
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangePolicy::AvailableSpaces => "available_spaces",
            ChangePolicy::AvailableSpacesOrClosed => "available_spaces_or_closed",
        }
    }
}

impl fmt::Display for ChangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available_spaces" => Ok(ChangePolicy::AvailableSpaces),
            "available_spaces_or_closed" => Ok(ChangePolicy::AvailableSpacesOrClosed),
            other => Err(format!(
                "unknown change policy '{}': expected available_spaces or available_spaces_or_closed",
                other
            )),
        }
    }
}
