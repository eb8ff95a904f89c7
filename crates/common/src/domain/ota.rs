use serde::{Deserialize, Serialize};

/// Firmware upgrade progress as reported by the device
///
/// Active states are ordered: `issued → downloading → verifying → applying`.
/// `success` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaState {
    Issued,
    Downloading,
    Verifying,
    Applying,
    Success,
    Failed,
}

impl OtaState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OtaState::Success | OtaState::Failed)
    }

    /// Position in the upgrade pipeline; terminal states rank last.
    pub fn rank(&self) -> u8 {
        match self {
            OtaState::Issued => 0,
            OtaState::Downloading => 1,
            OtaState::Verifying => 2,
            OtaState::Applying => 3,
            OtaState::Success | OtaState::Failed => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OtaState::Issued => "issued",
            OtaState::Downloading => "downloading",
            OtaState::Verifying => "verifying",
            OtaState::Applying => "applying",
            OtaState::Success => "success",
            OtaState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OtaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
