use serde::Serialize;

/// Where pipelines are placed. Process-wide, chosen once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl DeviceMap {
    /// Accelerator ordinal handed to out-of-process generators as `LOCAL_RANK`.
    pub fn local_rank(&self) -> Option<usize> {
        match self {
            Self::ForceCpu => None,
            Self::Ordinal(ordinal) => Some(*ordinal),
        }
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}
