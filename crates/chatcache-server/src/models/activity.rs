use serde::Serialize;

/// Which ranking an activity query targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityScope {
    Sessions,
    Users,
}

/// One ranking entry: id with its last-activity score (epoch millis)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub id: String,
    pub last_activity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivitySummary {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub recent_sessions: u64,
    pub today_sessions: u64,
}

/// Entries removed by a stale sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions_removed: u64,
    pub users_removed: u64,
    pub markers_removed: u64,
}
