use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-defined grouping of tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

pub const DEFAULT_TAB_NAME: &str = "Scan";

/// Blank tab names fall back to the default name.
pub fn normalize_tab_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        DEFAULT_TAB_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_names_use_default() {
        assert_eq!(normalize_tab_name("   "), "Scan");
        assert_eq!(normalize_tab_name(" lan "), "lan");
    }
}
