use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Storage form of a timestamp: `2026-03-01T10:00:00.000Z`.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw:?}: {e}"),
        })
}

pub fn parse_ts_opt(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_ts(&s, table, column)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kanbot_core::SpawnState;

    #[test]
    fn parse_enum_success() {
        let state: SpawnState = parse_enum("in_flight", "tasks", "spawn_state").unwrap();
        assert_eq!(state, SpawnState::InFlight);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<SpawnState, _> = parse_enum("busy", "tasks", "spawn_state");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "tasks", column: "spawn_state", .. })
        ));
    }

    #[test]
    fn parse_json_failure() {
        let result = parse_json("not valid json", "activity_log", "details");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "activity_log", column: "details", .. })
        ));
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 9, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(format_ts(late), "2026-03-01T10:00:00.000Z");
        assert!(format_ts(early) < format_ts(late));
        assert_eq!(parse_ts(&format_ts(late), "tasks", "created_at").unwrap(), late);
    }

    #[test]
    fn bad_timestamp_is_corrupt() {
        assert!(matches!(
            parse_ts("yesterday", "tasks", "created_at"),
            Err(StoreError::CorruptRow { column: "created_at", .. })
        ));
        assert_eq!(parse_ts_opt(None, "tasks", "spawn_started_at").unwrap(), None);
    }
}
